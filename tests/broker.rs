//! End-to-end broker tests over real sockets

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use relay_broker::{Broker, BrokerConfig, BrokerExit, TlsContext};

const WAIT: Duration = Duration::from_secs(5);

fn cert_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/certs")
}

fn tls_context() -> TlsContext {
    let dir = cert_dir();
    TlsContext::from_pem_files(&dir.join("cert.pem"), &dir.join("key.pem")).unwrap()
}

async fn spawn_broker(config: BrokerConfig) -> (SocketAddr, tokio::task::JoinHandle<BrokerExit>) {
    let mut broker = Broker::new(config.listen(vec!["127.0.0.1:0".parse().unwrap()]));
    let addrs = broker.bind().await.unwrap();
    let handle = tokio::spawn(async move { broker.run().await.unwrap() });
    (addrs[0], handle)
}

/// Read one LF-terminated line off the stream
async fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = timeout(WAIT, stream.read(&mut byte)).await.unwrap().unwrap();
        assert_ne!(n, 0, "unexpected end of stream while reading a line");
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return String::from_utf8(line).unwrap();
        }
    }
}

#[tokio::test]
async fn test_chat_client_sees_its_own_announcement() {
    let config = BrokerConfig::default().chat().conn_limit(1).no_stdin();
    let (addr, handle) = spawn_broker(config).await;

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    let joined = read_line(&mut c1).await;
    assert!(joined.contains("is connected as <user1>."), "got: {joined}");
    let roster = read_line(&mut c1).await;
    assert_eq!(roster, "<announce> already connected: nobody.\n");

    handle.abort();
}

#[tokio::test]
async fn test_connection_over_limit_is_dropped_without_data() {
    let config = BrokerConfig::default().chat().conn_limit(1).no_stdin();
    let (addr, handle) = spawn_broker(config).await;

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    // Once the announcement arrives, c1 is fully admitted.
    read_line(&mut c1).await;
    read_line(&mut c1).await;

    let mut c2 = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(WAIT, c2.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "denied connection must be closed without data");

    handle.abort();
}

#[tokio::test]
async fn test_chat_fanout_excludes_the_sender() {
    let config = BrokerConfig::default().chat().conn_limit(5).no_stdin();
    let (addr, handle) = spawn_broker(config).await;

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    read_line(&mut c1).await;
    read_line(&mut c1).await;

    // Join announcements go to everyone, two lines per join.
    let mut c2 = TcpStream::connect(addr).await.unwrap();
    read_line(&mut c2).await;
    read_line(&mut c2).await;
    read_line(&mut c1).await;
    read_line(&mut c1).await;

    let mut c3 = TcpStream::connect(addr).await.unwrap();
    read_line(&mut c3).await;
    read_line(&mut c3).await;
    read_line(&mut c1).await;
    read_line(&mut c1).await;
    read_line(&mut c2).await;
    read_line(&mut c2).await;

    c1.write_all(b"hi\n").await.unwrap();
    assert_eq!(read_line(&mut c2).await, "<user1> hi\n");
    assert_eq!(read_line(&mut c3).await, "<user1> hi\n");

    // The sender must not hear its own message back.
    let mut buf = [0u8; 64];
    let echoed = timeout(Duration::from_millis(300), c1.read(&mut buf)).await;
    assert!(echoed.is_err(), "sender received its own message");

    handle.abort();
}

#[tokio::test]
async fn test_disconnect_is_announced() {
    let config = BrokerConfig::default().chat().conn_limit(5).no_stdin();
    let (addr, handle) = spawn_broker(config).await;

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    read_line(&mut c1).await;
    read_line(&mut c1).await;

    let mut c2 = TcpStream::connect(addr).await.unwrap();
    read_line(&mut c2).await;
    read_line(&mut c2).await;
    read_line(&mut c1).await;
    read_line(&mut c1).await;

    drop(c2);
    assert_eq!(
        read_line(&mut c1).await,
        "<announce> <user2> is disconnected.\n"
    );

    handle.abort();
}

#[tokio::test]
async fn test_single_shot_exits_clean_on_peer_eof() {
    let config = BrokerConfig::default().conn_limit(1).no_stdin();
    let (addr, handle) = spawn_broker(config).await;

    let c1 = TcpStream::connect(addr).await.unwrap();
    drop(c1);

    let exit = timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(exit, BrokerExit::CleanEof);
}

#[tokio::test]
async fn test_keep_open_survives_disconnects_and_counts() {
    let config = BrokerConfig::default()
        .keep_open()
        .conn_limit(5)
        .no_stdin()
        .listen(vec!["127.0.0.1:0".parse().unwrap()]);
    let mut broker = Broker::new(config);
    let accounting = broker.accounting();
    let addr = broker.bind().await.unwrap()[0];
    let handle = tokio::spawn(async move { broker.run().await.unwrap() });

    for _ in 0..2 {
        let c = TcpStream::connect(addr).await.unwrap();
        drop(c);
    }

    // Reaping is asynchronous; poll the counters until they settle.
    timeout(WAIT, async {
        while accounting.total_reaped() != 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(accounting.total_established(), 2);
    assert_eq!(accounting.active(), 0);
    assert!(!handle.is_finished(), "keep-open broker must not exit");

    handle.abort();
}

#[tokio::test]
async fn test_single_shot_tls_garbage_handshake_fails() {
    let config = BrokerConfig::default().conn_limit(1).no_stdin();
    let mut broker =
        Broker::new(config.listen(vec!["127.0.0.1:0".parse().unwrap()])).with_tls(tls_context());
    let addr = broker.bind().await.unwrap()[0];
    let handle = tokio::spawn(async move { broker.run().await.unwrap() });

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    c1.write_all(b"this is definitely not a ClientHello")
        .await
        .unwrap();

    let exit = timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(exit, BrokerExit::HandshakeFailed);
}

mod tls_client {
    //! Blocking rustls client used against the TLS listener

    use std::sync::Arc;

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts whatever certificate the listener presents
    #[derive(Debug)]
    struct AcceptAny;

    impl ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PKCS1_SHA256,
            ]
        }
    }

    pub fn config() -> Arc<rustls::ClientConfig> {
        Arc::new(
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAny))
                .with_no_client_auth(),
        )
    }
}

#[tokio::test]
async fn test_tls_chat_client_completes_handshake_and_joins() {
    let config = BrokerConfig::default().chat().conn_limit(2).no_stdin();
    let mut broker =
        Broker::new(config.listen(vec!["127.0.0.1:0".parse().unwrap()])).with_tls(tls_context());
    let addr = broker.bind().await.unwrap()[0];
    let handle = tokio::spawn(async move { broker.run().await.unwrap() });

    let client_config = tls_client::config();
    let announce = tokio::task::spawn_blocking(move || {
        use std::io::Read;

        let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let mut conn = rustls::ClientConnection::new(client_config, server_name).unwrap();
        let mut sock = std::net::TcpStream::connect(addr).unwrap();
        sock.set_read_timeout(Some(WAIT)).unwrap();
        let mut tls = rustls::Stream::new(&mut conn, &mut sock);

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while !line.ends_with(b"nobody.\n") {
            tls.read_exact(&mut byte).unwrap();
            line.push(byte[0]);
        }
        String::from_utf8(line).unwrap()
    });

    let announce = timeout(WAIT, announce).await.unwrap().unwrap();
    assert!(announce.contains("is connected as <user1>."), "got: {announce}");
    assert!(announce.ends_with("<announce> already connected: nobody.\n"));

    handle.abort();
}

#[tokio::test]
async fn test_run_until_reports_timeout() {
    let config = BrokerConfig::default()
        .keep_open()
        .no_stdin()
        .listen(vec!["127.0.0.1:0".parse().unwrap()]);
    let mut broker = Broker::new(config);
    broker.bind().await.unwrap();

    let exit = broker
        .run_until(tokio::time::sleep(Duration::from_millis(100)))
        .await
        .unwrap();
    assert_eq!(exit, BrokerExit::TimedOut);
}

#[tokio::test]
async fn test_address_policy_rejects_peer() {
    let config = BrokerConfig::default()
        .chat()
        .conn_limit(5)
        .no_stdin()
        .listen(vec!["127.0.0.1:0".parse().unwrap()]);
    // Deny everyone.
    let mut broker = Broker::new(config).with_policy(|_peer: SocketAddr| false);
    let addr = broker.bind().await.unwrap()[0];
    let handle = tokio::spawn(async move { broker.run().await.unwrap() });

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(WAIT, c1.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);

    handle.abort();
}

#[tokio::test]
async fn test_exec_hook_owns_the_connection() {
    let config = BrokerConfig::default()
        .keep_open()
        .conn_limit(2)
        .no_stdin()
        .listen(vec!["127.0.0.1:0".parse().unwrap()]);
    let mut broker = Broker::new(config).with_hook(
        |mut stream: relay_broker::PeerStream, _peer: SocketAddr| async move {
            // Echo one chunk back, uppercased.
            let mut buf = [0u8; 64];
            let n = stream.recv(&mut buf).await?;
            let reply: Vec<u8> = buf[..n].iter().map(|b| b.to_ascii_uppercase()).collect();
            stream.send_all(&reply).await
        },
    );
    let addr = broker.bind().await.unwrap()[0];
    let handle = tokio::spawn(async move { broker.run().await.unwrap() });

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    c1.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(WAIT, c1.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"HELLO");

    handle.abort();
}

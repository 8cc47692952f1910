use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tunnel_server::{
    config::{Config, Forward, Log, Mode, Options, Tunnel},
    server,
    statistics::Monitor,
};

fn free_udp_addrs() -> Result<(SocketAddr, SocketAddr)> {
    let a = std::net::UdpSocket::bind("127.0.0.1:0")?;
    let b = std::net::UdpSocket::bind("127.0.0.1:0")?;
    Ok((a.local_addr()?, b.local_addr()?))
}

fn free_tcp_addr() -> Result<SocketAddr> {
    let socket = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(socket.local_addr()?)
}

/// Boot both forwarder halves from plain configs and push bytes through
/// the whole stack, the way the binary would run them.
#[tokio::test]
async fn test_config_driven_echo() -> Result<()> {
    let (client_udp, server_udp) = free_udp_addrs()?;
    let listen = free_tcp_addr()?;

    let backend = TcpListener::bind("127.0.0.1:0").await?;
    let backend_addr = backend.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = backend.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(size) => {
                            if stream.write_all(&buf[..size]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    let client_config = Config {
        tunnel: Tunnel {
            bind: client_udp,
            peer: Some(server_udp),
        },
        options: Options::default(),
        rules: vec![Forward {
            mode: Mode::Client,
            service: "echo".to_string(),
            address: listen,
        }],
        log: Log::default(),
    };

    let server_config = Config {
        tunnel: Tunnel {
            bind: server_udp,
            peer: Some(client_udp),
        },
        options: Options::default(),
        rules: vec![Forward {
            mode: Mode::Server,
            service: "echo".to_string(),
            address: backend_addr,
        }],
        log: Log::default(),
    };

    let client_monitor = Monitor::default();
    let _client = server::run(Arc::new(client_config), client_monitor.clone()).await?;
    let _server = server::run(Arc::new(server_config), Monitor::default()).await?;

    let mut data = vec![0u8; 64 * 1024];
    rand::rng().fill(&mut data[..]);

    let stream = TcpStream::connect(listen).await?;
    let (mut reader, mut writer) = stream.into_split();

    let send = data.clone();
    let feeder = tokio::spawn(async move {
        let _ = writer.write_all(&send).await;
        writer
    });

    let mut echo = vec![0u8; data.len()];
    timeout(Duration::from_secs(60), reader.read_exact(&mut echo)).await??;
    assert_eq!(echo, data);

    drop(feeder.await?);
    assert_eq!(client_monitor.snapshot().established, 1);
    Ok(())
}

//! Fake SOCKS5 proxy for integration testing
//!
//! Speaks the no-authentication CONNECT subset of RFC 1928 and routes
//! domain-name targets to local ports from a fixed table, so a probe
//! for `imap.test:993` can reach a fake server on `127.0.0.1:<port>`.
//! Targets missing from the table get a "host unreachable" reply.
//!
//! ```text
//!   client: 05 01 00                      greeting, one method: no auth
//!   proxy:  05 00                         no auth selected
//!   client: 05 01 00 03 <len> <name> <port>  CONNECT to a domain name
//!   proxy:  05 00 00 01 <addr> <port>     success, then raw relay
//! ```

#![allow(dead_code)]

use onion_onboard::proxy::ProxyEndpoint;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct FakeSocksProxy {
    port: u16,
    requests: Arc<Mutex<Vec<(String, u16)>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeSocksProxy {
    /// Start a proxy routing each `(host, local_port)` pair.
    pub async fn start(routes: &[(&str, u16)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let routes: Arc<HashMap<String, u16>> = Arc::new(
            routes
                .iter()
                .map(|(host, port)| ((*host).to_string(), *port))
                .collect(),
        );
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let routes = Arc::clone(&routes);
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let _ = relay(stream, &routes, &seen).await;
                });
            }
        });

        Self {
            port,
            requests,
            _handle: handle,
        }
    }

    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint::new("127.0.0.1", self.port)
    }

    /// Every CONNECT target requested so far.
    pub fn requests(&self) -> Vec<(String, u16)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn relay(
    mut client: TcpStream,
    routes: &HashMap<String, u16>,
    seen: &Mutex<Vec<(String, u16)>>,
) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    let mut methods = vec![0u8; usize::from(head[1])];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    if request[1] != 0x01 || request[3] != 0x03 {
        client.write_all(&[0x05, 0x07, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    }
    let len = client.read_u8().await?;
    let mut name = vec![0u8; usize::from(len)];
    client.read_exact(&mut name).await?;
    let port = client.read_u16().await?;
    let host = String::from_utf8_lossy(&name).into_owned();
    seen.lock().unwrap().push((host.clone(), port));

    let Some(&local) = routes.get(&host) else {
        client.write_all(&[0x05, 0x04, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    };
    let Ok(mut upstream) = TcpStream::connect(("127.0.0.1", local)).await else {
        client.write_all(&[0x05, 0x05, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    };

    client.write_all(&[0x05, 0x00, 0, 1, 127, 0, 0, 1, 0, 0]).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

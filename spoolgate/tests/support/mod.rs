//! Minimal relay that accepts every message
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

pub struct AcceptingRelay {
    addr: SocketAddr,
    messages: Arc<Mutex<Vec<String>>>,
}

impl AcceptingRelay {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let messages = Arc::new(Mutex::new(Vec::new()));

        let store = Arc::clone(&messages);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let _ = Self::session(stream, store).await;
                });
            }
        });

        Ok(Self { addr, messages })
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }

    async fn session(mut stream: TcpStream, store: Arc<Mutex<Vec<String>>>) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(b"220 relay.test ESMTP\r\n").await?;

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }

            let verb = line.trim().split(' ').next().unwrap_or_default().to_uppercase();
            match verb.as_str() {
                "DATA" => {
                    writer.write_all(b"354 go ahead\r\n").await?;
                    let mut content = String::new();
                    loop {
                        line.clear();
                        if reader.read_line(&mut line).await? == 0 {
                            return Ok(());
                        }
                        if line == ".\r\n" {
                            break;
                        }
                        content.push_str(&line);
                    }
                    store.lock().await.push(content);
                    writer.write_all(b"250 queued\r\n").await?;
                }
                "QUIT" => {
                    writer.write_all(b"221 bye\r\n").await?;
                    return Ok(());
                }
                _ => writer.write_all(b"250 ok\r\n").await?,
            }
        }
    }
}

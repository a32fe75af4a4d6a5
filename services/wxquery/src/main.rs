//! Test client for the weather daemon.
//!
//! Sends one request datagram and prints the decoded reply, e.g.:
//!
//! ```text
//! wxquery '?41.38|2.18'
//! wxquery '?KJFK'
//! wxquery '!ping'
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;

use wx_protocol::{decode_reply, Reply};

#[derive(Parser, Debug)]
#[command(name = "wxquery")]
#[command(about = "Send one request to the weather daemon and print the reply")]
struct Args {
    /// Request string, e.g. `?41.38|2.18`, `?KJFK` or `!ping`
    request: String,

    /// Daemon address
    #[arg(long, default_value = "127.0.0.1:8950")]
    addr: String,

    /// Reply timeout in seconds
    #[arg(long, default_value = "5")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let socket = UdpSocket::bind("127.0.0.1:0").await.context("Could not bind local socket")?;
    socket.connect(&args.addr).await.with_context(|| format!("Could not reach {}", args.addr))?;
    socket.send(args.request.as_bytes()).await.context("Send failed")?;

    // Verbs like !reload send no reply at all
    let mut buf = vec![0u8; 65_536];
    let len = match tokio::time::timeout(Duration::from_secs(args.timeout), socket.recv(&mut buf))
        .await
    {
        Ok(received) => received.context("Receive failed")?,
        Err(_) => {
            println!("(no reply)");
            return Ok(());
        }
    };

    match decode_reply(&buf[..len]).context("Could not decode reply")? {
        Reply::Text(text) => println!("{}", text),
        Reply::False => println!("false"),
        reply => println!("{:#?}", reply),
    }

    Ok(())
}

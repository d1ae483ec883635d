//! Simple client that sends messages to a saltwire server and prints the
//! echoes.
//!
//! Run the server first:
//! - cargo run -p saltwire --example server -- 9000
//!
//! Then run the client:
//! - cargo run -p saltwire --example client -- 127.0.0.1:9000
//! - cargo run -p saltwire --example client -- 127.0.0.1:9000 10 200
//!   (sends 10 messages, 200ms apart)

use std::{env, net::SocketAddr, sync::Arc, thread, time::Duration};

use crossbeam_channel::unbounded;
use saltwire::prelude::*;

struct Message {
    text: String,
}

impl Packet for Message {
    fn id(&self) -> u8 {
        0
    }

    fn write(&self, writer: &mut BitWriter) {
        let bytes = self.text.as_bytes();
        writer.write_u16(bytes.len() as u16);
        for byte in bytes {
            writer.write_u8(*byte);
        }
    }

    fn read(&mut self, reader: &mut BitReader<'_>) -> saltwire::Result<()> {
        let len = reader.read_u16()? as usize;
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(reader.read_u8()?);
        }
        self.text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct ChatFactory;

impl PacketFactory for ChatFactory {
    fn type_count(&self) -> u8 {
        1
    }

    fn create(&self, id: u8) -> Option<Box<dyn Packet>> {
        (id == 0).then(|| Box::new(Message { text: String::new() }) as Box<dyn Packet>)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Args: <server_addr> [count] [interval_ms]
    let mut args = env::args().skip(1);
    let server_addr: SocketAddr =
        args.next().unwrap_or_else(|| "127.0.0.1:9000".to_string()).parse()?;
    let count: usize = args.next().unwrap_or_else(|| "5".into()).parse().unwrap_or(5);
    let interval_ms: u64 = args.next().unwrap_or_else(|| "300".into()).parse().unwrap_or(300);

    let (status_tx, status_rx) = unbounded();
    let callbacks = ConnectionCallbacks {
        on_connected: Arc::new(move |status| {
            status_tx.send(status).ok();
        }),
        on_packet: Arc::new(|packet| {
            if let Some(message) = packet.as_any().downcast_ref::<Message>() {
                println!("[reply] {}", message.text);
            }
        }),
        on_disconnect: Arc::new(|| println!("[closed by peer]")),
    };

    let connection = Connection::new(Arc::new(ChatFactory), Config::default(), callbacks);
    connection.set_packet_channel(0, ChannelKind::OrderedReliable)?;
    connection.connect(server_addr)?;

    match status_rx.recv_timeout(Duration::from_secs(10))? {
        ConnectStatus::Success => {
            println!("connected to {} as {}", server_addr, connection.local_addr()?)
        }
        status => {
            eprintln!("connect failed: {:?}", status);
            return Ok(());
        }
    }

    for i in 0..count {
        let message = Message { text: format!("hello {}", i) };
        connection.send(&message)?;
        thread::sleep(Duration::from_millis(interval_ms));
    }

    // Give the last echoes a moment to arrive before saying goodbye.
    thread::sleep(Duration::from_millis(500));
    let stats = connection.stats();
    println!("sent {} datagrams, received {}", stats.packets_sent, stats.packets_received);
    connection.disconnect();
    Ok(())
}

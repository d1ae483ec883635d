//! Echo server accepting saltwire connections.
//!
//! Run the server first:
//! - cargo run -p saltwire --example server -- 9000
//!
//! Then point one or more clients at it:
//! - cargo run -p saltwire --example client -- 127.0.0.1:9000

use std::{env, sync::Arc, thread, time::Duration};

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

    // Args: [port] [max_clients]
    let mut args = env::args().skip(1);
    let port: u16 = args.next().unwrap_or_else(|| "9000".into()).parse()?;
    let max_clients: u16 = args.next().unwrap_or_else(|| "4".into()).parse()?;

    let callbacks = ListenerCallbacks {
        on_connection: Arc::new(|connection: Connection| {
            println!("[accept] {:?}", connection.remote_addr());
            connection.set_packet_channel(0, ChannelKind::OrderedReliable).ok();
            let echo = connection.clone();
            connection.set_callbacks(ConnectionCallbacks {
                on_packet: Arc::new(move |packet| {
                    if let Some(message) = packet.as_any().downcast_ref::<Message>() {
                        println!("[recv] {}", message.text);
                        let reply = Message { text: format!("echo: {}", message.text) };
                        if let Err(e) = echo.send(&reply) {
                            eprintln!("[send failed] {}", e);
                        }
                    }
                }),
                on_disconnect: Arc::new(|| println!("[closed]")),
                ..ConnectionCallbacks::default()
            });
        }),
    };

    let listener =
        Listener::new(port, max_clients, Arc::new(ChatFactory), Config::default(), callbacks);
    listener.start()?;
    println!("saltwire server on port {} ({} client slots)", port, max_clients);

    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

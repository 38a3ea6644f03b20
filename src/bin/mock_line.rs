//! Mock conveyor line
//!
//! Simulates the devices of one sorting line for local testing and feeds the
//! sorter identified packages through its ingest port.
//!
//! Pendulum mode (default):
//! 1. Entry sensor on --trigger-port, one lane sensor/actuator per --lane-ports
//! 2. Every --interval-ms a package enters: entry pulse `+OCCH1:1`
//! 3. After --ident-delay-ms the package is reported as `PKG <n> <chute> <barcode>`
//! 4. After the lane travel time the lane sensor pulses
//! 5. Actuator commands received on lane ports are decoded and logged
//!
//! PLC mode (--plc): a single PLC on --plc-port announces sequence numbers and
//! answers every sort command with an OK feedback frame.
//!
//! Usage:
//!   cargo run --bin mock-line -- --lane-ports 4011,4012 --lane-travel-ms 2000,3000

use bytes::{Buf, BytesMut};
use clap::Parser;
use pendulum_sorter::io::error::Decoded;
use pendulum_sorter::io::plc::{PlcFrame, FEEDBACK_OK};
use pendulum_sorter::io::sensor::{ActuatorCommand, CommandTable, SensorSignal};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(name = "mock-line")]
#[command(about = "Mock sensors, pendulums and PLC for local simulation")]
struct Args {
    /// Entry sensor port
    #[arg(long, default_value = "4001")]
    trigger_port: u16,

    /// Lane device ports, comma separated
    #[arg(long, value_delimiter = ',', default_value = "4011,4012")]
    lane_ports: Vec<u16>,

    /// Entry-to-lane travel time per lane, comma separated
    #[arg(long, value_delimiter = ',', default_value = "2000,3000")]
    lane_travel_ms: Vec<u64>,

    /// Chutes served by each lane
    #[arg(long, default_value = "2")]
    chutes_per_lane: u16,

    /// Simulate a PLC line instead of sensors and pendulums
    #[arg(long)]
    plc: bool,

    /// PLC port
    #[arg(long, default_value = "4020")]
    plc_port: u16,

    /// Sorter ingest address
    #[arg(long, default_value = "127.0.0.1:25900")]
    ingest_addr: String,

    /// Time between packages (ms)
    #[arg(long, default_value = "2000")]
    interval_ms: u64,

    /// Entry pulse to identification delay (ms)
    #[arg(long, default_value = "400")]
    ident_delay_ms: u64,

    /// Number of packages to send (0 = forever)
    #[arg(long, default_value = "0")]
    count: u64,
}

/// One listening device; keeps the writer of its latest connection
#[derive(Clone)]
struct DeviceServer {
    name: String,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl DeviceServer {
    async fn bind(name: &str, port: u16, on_bytes: fn(&str, &mut BytesMut)) -> std::io::Result<Self> {
        let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        let server = Self { name: name.to_string(), writer: Arc::new(Mutex::new(None)) };
        println!("[MOCK] {name} listening on port {port}");

        let accept = server.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    continue;
                };
                println!("[MOCK] {} connected from {}", accept.name, peer);
                let (mut reader, writer) = socket.into_split();
                *accept.writer.lock().await = Some(writer);

                let name = accept.name.clone();
                tokio::spawn(async move {
                    let mut buf = BytesMut::with_capacity(256);
                    let mut temp = [0u8; 256];
                    loop {
                        match reader.read(&mut temp).await {
                            Ok(0) | Err(_) => {
                                println!("[MOCK] {name} disconnected");
                                break;
                            }
                            Ok(n) => {
                                buf.extend_from_slice(&temp[..n]);
                                on_bytes(&name, &mut buf);
                            }
                        }
                    }
                });
            }
        });

        Ok(server)
    }

    async fn send(&self, bytes: &[u8]) -> bool {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            println!("[MOCK] {} not connected, dropping {} bytes", self.name, bytes.len());
            return false;
        };
        if stream.write_all(bytes).await.is_err() {
            *writer = None;
            return false;
        }
        true
    }

    async fn pulse(&self) {
        if self.send(&SensorSignal::triggered(1).encode()).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.send(&SensorSignal { channel: 1, triggered: false }.encode()).await;
        }
    }
}

/// Decode and log actuator commands
fn log_actuator_commands(name: &str, buf: &mut BytesMut) {
    let commands = CommandTable::default();
    while !buf.is_empty() {
        let found = ActuatorCommand::ALL
            .into_iter()
            .find(|cmd| buf.starts_with(commands.frame(*cmd)));
        match found {
            Some(cmd) => {
                println!("[MOCK] {name} <- {}", cmd.as_str());
                buf.advance(commands.frame(cmd).len());
            }
            None if buf.len() >= 4 => {
                println!("[MOCK] {name} <- unknown byte 0x{:02X}", buf[0]);
                buf.advance(1);
            }
            None => break,
        }
    }
}

/// Sort commands seen by the PLC, answered from the simulation loop
static PLC_COMMANDS: std::sync::Mutex<Vec<(u16, u8)>> = std::sync::Mutex::new(Vec::new());

fn log_plc_frames(name: &str, buf: &mut BytesMut) {
    while let Some((outcome, consumed)) = PlcFrame::parse(buf) {
        buf.advance(consumed);
        match outcome {
            Decoded::Frame(PlcFrame::SortCommand { seq, chute }) => {
                println!("[MOCK] {name} <- sort seq={seq} chute={chute}");
                if let Ok(mut pending) = PLC_COMMANDS.lock() {
                    pending.push((seq, chute));
                }
            }
            Decoded::Frame(other) => println!("[MOCK] {name} <- unexpected {other:?}"),
            Decoded::Skip => {}
            Decoded::Invalid(e) => println!("[MOCK] {name} <- invalid frame: {e}"),
        }
    }
}

fn ignore_bytes(_name: &str, buf: &mut BytesMut) {
    buf.clear();
}

/// Persistent ingest client; replies are printed as they arrive
async fn connect_ingest(addr: &str) -> Option<Arc<Mutex<OwnedWriteHalf>>> {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("[MOCK] Ingest {addr} unavailable: {e}");
            return None;
        }
    };
    let (reader, writer) = stream.into_split();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            println!("[MOCK] sorter -> {line}");
        }
    });
    Some(Arc::new(Mutex::new(writer)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("[MOCK] Mock line starting ({} mode)", if args.plc { "plc" } else { "pendulum" });

    let (trigger, lanes, plc) = if args.plc {
        let plc = DeviceServer::bind("plc", args.plc_port, log_plc_frames).await?;
        (None, Vec::new(), Some(plc))
    } else {
        let trigger = DeviceServer::bind("trigger", args.trigger_port, ignore_bytes).await?;
        let mut lanes = Vec::with_capacity(args.lane_ports.len());
        for (idx, port) in args.lane_ports.iter().enumerate() {
            lanes.push(DeviceServer::bind(&format!("lane-{}", idx + 1), *port, log_actuator_commands).await?);
        }
        (Some(trigger), lanes, None)
    };

    // Give the sorter time to connect before the first package
    tokio::time::sleep(Duration::from_secs(3)).await;
    let ingest = connect_ingest(&args.ingest_addr).await;

    let lane_count = lanes.len().max(1) as u16;
    let chute_count = lane_count * args.chutes_per_lane.max(1);
    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms));
    let mut index: u64 = 0;

    loop {
        interval.tick().await;
        index += 1;
        if args.count > 0 && index > args.count {
            break;
        }

        let chute = ((index - 1) % u64::from(chute_count)) as u16 + 1;
        let lane = usize::from((chute - 1) / args.chutes_per_lane.max(1));
        let seq = (index & 0xFFFF) as u16;
        println!("[MOCK] package {index} enters (chute {chute})");

        if let Some(trigger) = &trigger {
            trigger.pulse().await;
        }
        if let Some(plc) = &plc {
            plc.send(&PlcFrame::SequenceNotice { seq }.encode()).await;
        }

        if let Some(ingest) = &ingest {
            let ingest = Arc::clone(ingest);
            let delay = Duration::from_millis(args.ident_delay_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let line = format!("PKG {index} {chute} BC{index:06}\n");
                if let Err(e) = ingest.lock().await.write_all(line.as_bytes()).await {
                    eprintln!("[MOCK] Ingest write failed: {e}");
                }
            });
        }

        if let Some(lane_server) = lanes.get(lane).cloned() {
            let travel = Duration::from_millis(args.lane_travel_ms.get(lane).copied().unwrap_or(2000));
            tokio::spawn(async move {
                tokio::time::sleep(travel).await;
                lane_server.pulse().await;
            });
        }

        if let Some(plc) = &plc {
            let answered: Vec<(u16, u8)> =
                PLC_COMMANDS.lock().map(|mut pending| pending.drain(..).collect()).unwrap_or_default();
            for (seq, chute) in answered {
                plc.send(&PlcFrame::Feedback { seq, error: FEEDBACK_OK, chute }.encode()).await;
            }
        }
    }

    println!("[MOCK] Sent {} packages, waiting for the line to drain", args.count);
    tokio::time::sleep(Duration::from_secs(10)).await;
    Ok(())
}

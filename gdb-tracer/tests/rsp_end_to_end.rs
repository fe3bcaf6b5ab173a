//! End-to-end tracing over the GDB remote serial protocol against an
//! in-process gdbstub emulating an instrumented target.

use gdb_tracer::packets::{
    encode_packet, AllocationPacket, FreePacket, StackInfoPacket, TestcaseRequestPacket,
};
use gdb_tracer::rsp::checksum;
use gdb_tracer::{
    read_trace, AllocationRecord, GdbTracer, Packet, RspSession, StackBounds, TraceEntity,
    TraceRecord, TracerError,
};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

const BUFFER: u64 = 0xffff_ffff_8011_1020;

enum Event {
    Packet(Packet),
    Step,
}

/// Minimal gdbstub: flat memory plus a script of resume outcomes
struct Stub {
    stream: DuplexStream,
    memory: HashMap<u64, u8>,
    script: VecDeque<Event>,
    resumes: Vec<String>,
}

impl Stub {
    async fn receive(&mut self) -> Option<String> {
        let mut byte = [0u8; 1];
        loop {
            if self.stream.read_exact(&mut byte).await.is_err() {
                return None;
            }
            if byte[0] == b'$' {
                break;
            }
        }
        let mut payload = Vec::new();
        loop {
            self.stream.read_exact(&mut byte).await.ok()?;
            if byte[0] == b'#' {
                break;
            }
            payload.push(byte[0]);
        }
        let mut sum = [0u8; 2];
        self.stream.read_exact(&mut sum).await.ok()?;
        self.stream.write_all(b"+").await.ok()?;
        String::from_utf8(payload).ok()
    }

    async fn send(&mut self, payload: &str) {
        let frame = format!("${}#{:02x}", payload, checksum(payload.as_bytes()));
        self.stream.write_all(frame.as_bytes()).await.unwrap();
        let mut ack = [0u8; 1];
        self.stream.read_exact(&mut ack).await.unwrap();
    }

    fn parse_address_length(args: &str) -> (u64, usize) {
        let (address, length) = args.split_once(',').unwrap();
        (
            u64::from_str_radix(address, 16).unwrap(),
            usize::from_str_radix(length, 16).unwrap(),
        )
    }

    async fn serve(mut self) -> Self {
        while let Some(packet) = self.receive().await {
            let reply = if packet.starts_with("qSupported") {
                "PacketSize=4000".to_string()
            } else if packet == "vCont?" {
                "vCont;c;C;s;S".to_string()
            } else if packet == "?" {
                "S05".to_string()
            } else if packet.starts_with("Z2,") {
                "OK".to_string()
            } else if let Some(rest) = packet.strip_prefix('M') {
                let (header, data) = rest.split_once(':').unwrap();
                let (address, _) = Self::parse_address_length(header);
                for (i, byte) in hex::decode(data).unwrap().into_iter().enumerate() {
                    self.memory.insert(address + i as u64, byte);
                }
                "OK".to_string()
            } else if let Some(rest) = packet.strip_prefix('m') {
                let (address, length) = Self::parse_address_length(rest);
                let bytes: Vec<u8> = (0..length as u64)
                    .map(|i| self.memory.get(&(address + i)).copied().unwrap_or(0))
                    .collect();
                hex::encode(bytes)
            } else if packet.starts_with("vCont;") {
                self.resumes.push(packet.clone());
                match self.script.pop_front() {
                    Some(Event::Packet(p)) => {
                        for (i, byte) in encode_packet(&p).unwrap().iter().enumerate() {
                            self.memory.insert(BUFFER + i as u64, *byte);
                        }
                        format!("T05watch:{:x};thread:01;", BUFFER)
                    }
                    Some(Event::Step) => "T05thread:01;".to_string(),
                    None => "W00".to_string(),
                }
            } else if packet == "D" {
                self.send("OK").await;
                break;
            } else {
                String::new()
            };
            self.send(&reply).await;
        }
        self
    }
}

fn stub(stream: DuplexStream, script: Vec<Event>) -> Stub {
    Stub {
        stream,
        memory: HashMap::new(),
        script: script.into(),
        resumes: Vec::new(),
    }
}

fn request(buffer_size: i64) -> Event {
    Event::Packet(Packet::TestcaseRequest(TestcaseRequestPacket {
        address: 0x2000,
        buffer_size,
        testcase_size: 0,
    }))
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("gdb_tracer=trace")
        .try_init();
}

#[tokio::test]
async fn test_trace_over_rsp() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let testcase = dir.path().join("0.testcase");
    std::fs::write(&testcase, [0x11u8; 16]).unwrap();

    let (client, server) = tokio::io::duplex(1 << 16);
    let stub = stub(
        server,
        vec![
            request(32),
            Event::Packet(Packet::TestcaseStart),
            Event::Packet(Packet::StackInfo(StackInfoPacket {
                base_address: 0x7fff_0000,
                top_address: 0x7ffe_0000,
            })),
            Event::Step,
            Event::Packet(Packet::Allocation(AllocationPacket {
                address: 0x5000,
                length: 64,
            })),
            Event::Step,
            Event::Packet(Packet::Free(FreePacket { address: 0x5000 })),
            Event::Packet(Packet::TestcaseEnd),
        ],
    );
    let server = tokio::spawn(stub.serve());

    let mut tracer = GdbTracer::attach(RspSession::new(client), BUFFER, CancellationToken::new())
        .await
        .unwrap();
    let summary = tracer
        .generate_trace(
            &TraceEntity {
                id: 0,
                testcase_file_path: testcase,
            },
            dir.path(),
        )
        .await
        .unwrap();
    tracer.shutdown().await;
    let stub = server.await.unwrap();

    assert_eq!(
        summary.stack,
        Some(StackBounds {
            low: 0x7ffe_0000,
            high: 0x7fff_0000
        })
    );
    assert_eq!(summary.steps, 2);

    let records = read_trace(File::open(&summary.trace_file).unwrap()).unwrap();
    assert_eq!(
        records,
        vec![
            TraceRecord::Allocation(AllocationRecord {
                id: 0,
                address: 0x5000,
                size: 64
            }),
            TraceRecord::Free { id: 0 },
        ]
    );

    // Test case landed in target memory
    let delivered: Vec<u8> = (0..16)
        .map(|i| stub.memory.get(&(0x2000 + i)).copied().unwrap_or(0))
        .collect();
    assert_eq!(delivered, vec![0x11; 16]);

    assert_eq!(
        stub.resumes,
        vec!["vCont;c", "vCont;c", "vCont;s", "vCont;s", "vCont;s", "vCont;s", "vCont;s", "vCont;s"]
    );
}

#[tokio::test]
async fn test_oversized_testcase_over_rsp() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let testcase = dir.path().join("1.testcase");
    std::fs::write(&testcase, [0u8; 40]).unwrap();

    let (client, server) = tokio::io::duplex(1 << 16);
    let server = tokio::spawn(stub(server, vec![request(32)]).serve());

    let mut tracer = GdbTracer::attach(RspSession::new(client), BUFFER, CancellationToken::new())
        .await
        .unwrap();
    let err = tracer
        .generate_trace(
            &TraceEntity {
                id: 1,
                testcase_file_path: testcase,
            },
            dir.path(),
        )
        .await
        .unwrap_err();
    tracer.shutdown().await;
    let stub = server.await.unwrap();

    assert!(matches!(err, TracerError::InsufficientBuffer { .. }));
    assert!(!stub.memory.contains_key(&0x2000));
    assert!(!dir.path().join("t1.trace").exists());
}

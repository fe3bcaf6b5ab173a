//! Communication packets
//!
//! Fixed-layout binary structures exchanged with the instrumented target
//! through the communication buffer. All fields are little-endian and packed;
//! the layout is shared with the target binary and must match byte for byte.
//!
//! Buffer layout:
//!
//! ```text
//! [0]       trigger code (who wrote last)
//! [1..8)    unused
//! [8..12)   packet type tag (u32)
//! [12..)    packet payload
//! ```

use crate::error::TracerError;
use binrw::io::Cursor;
use binrw::{binrw, BinRead, BinWrite};

/// Offset of the trigger byte
pub const TRIGGER_OFFSET: usize = 0;

/// Offset of the little-endian packet type tag
pub const TYPE_OFFSET: usize = 8;

/// Offset of the packet payload
pub const PAYLOAD_OFFSET: usize = 12;

/// Length of the largest payload the target may send or receive
pub const MAX_PAYLOAD_LEN: usize = TestcaseRequestPacket::LEN;

/// Total length of the communication buffer
pub const BUFFER_LEN: usize = PAYLOAD_OFFSET + MAX_PAYLOAD_LEN;

const _: () = assert!(AllocationPacket::LEN <= MAX_PAYLOAD_LEN);
const _: () = assert!(FreePacket::LEN <= MAX_PAYLOAD_LEN);
const _: () = assert!(StackInfoPacket::LEN <= MAX_PAYLOAD_LEN);

/// Codes used for indicating which peer wrote the buffer last
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerCode {
    TargetWrite = 0x01,
    DebuggerWrite = 0x02,
}

/// Wire tag of a communication packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    Allocation = 1,
    Free = 2,
    TestcaseRequest = 3,
    TestcaseStart = 4,
    TestcaseEnd = 5,
    StackInfo = 6,
    StepoverBegin = 7,
    StepoverEnd = 8,
}

impl TryFrom<u32> for PacketType {
    type Error = TracerError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => PacketType::Allocation,
            2 => PacketType::Free,
            3 => PacketType::TestcaseRequest,
            4 => PacketType::TestcaseStart,
            5 => PacketType::TestcaseEnd,
            6 => PacketType::StackInfo,
            7 => PacketType::StepoverBegin,
            8 => PacketType::StepoverEnd,
            other => return Err(TracerError::UnknownPacketType(other)),
        })
    }
}

/// Header at the start of the communication buffer
///
/// Bytes between the trigger code and the tag are unused and written as
/// zeros.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw [`TriggerCode`]
    pub trigger: u8,

    /// Raw [`PacketType`] tag
    #[brw(pad_before = 7)]
    pub tag: u32,
}

/// Target reports a new heap allocation
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPacket {
    pub address: u64,
    pub length: u32,
}

impl AllocationPacket {
    /// Encoded length in bytes
    pub const LEN: usize = 12;
}

/// Target reports a heap free
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreePacket {
    pub address: u64,
}

impl FreePacket {
    /// Encoded length in bytes
    pub const LEN: usize = 8;
}

/// Target asks for the next test case
///
/// This is the only payload the tracer writes back: `testcase_size` is
/// filled in once the test case has been copied to `address`.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestcaseRequestPacket {
    pub address: u64,
    pub buffer_size: i64,
    pub testcase_size: i64,
}

impl TestcaseRequestPacket {
    /// Encoded length in bytes
    pub const LEN: usize = 24;

    /// Copy of this request with the written-back test case size set
    pub fn with_testcase_size(self, testcase_size: i64) -> Self {
        Self {
            testcase_size,
            ..self
        }
    }
}

/// Target reports the bounds of its stack
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackInfoPacket {
    pub base_address: u64,
    pub top_address: u64,
}

impl StackInfoPacket {
    /// Encoded length in bytes
    pub const LEN: usize = 16;
}

/// A decoded communication packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Allocation(AllocationPacket),
    Free(FreePacket),
    TestcaseRequest(TestcaseRequestPacket),
    TestcaseStart,
    TestcaseEnd,
    StackInfo(StackInfoPacket),
    StepoverBegin,
    StepoverEnd,
}

impl Packet {
    /// Decode the packet held in a communication buffer
    ///
    /// Unknown tags are a protocol desynchronization and fail.
    pub fn decode(buffer: &[u8]) -> Result<Self, TracerError> {
        let mut reader = Cursor::new(buffer);
        let header = PacketHeader::read(&mut reader)?;
        Ok(match PacketType::try_from(header.tag)? {
            PacketType::Allocation => Packet::Allocation(AllocationPacket::read(&mut reader)?),
            PacketType::Free => Packet::Free(FreePacket::read(&mut reader)?),
            PacketType::TestcaseRequest => {
                Packet::TestcaseRequest(TestcaseRequestPacket::read(&mut reader)?)
            }
            PacketType::TestcaseStart => Packet::TestcaseStart,
            PacketType::TestcaseEnd => Packet::TestcaseEnd,
            PacketType::StackInfo => Packet::StackInfo(StackInfoPacket::read(&mut reader)?),
            PacketType::StepoverBegin => Packet::StepoverBegin,
            PacketType::StepoverEnd => Packet::StepoverEnd,
        })
    }

    /// Wire tag of this packet
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Allocation(_) => PacketType::Allocation,
            Packet::Free(_) => PacketType::Free,
            Packet::TestcaseRequest(_) => PacketType::TestcaseRequest,
            Packet::TestcaseStart => PacketType::TestcaseStart,
            Packet::TestcaseEnd => PacketType::TestcaseEnd,
            Packet::StackInfo(_) => PacketType::StackInfo,
            Packet::StepoverBegin => PacketType::StepoverBegin,
            Packet::StepoverEnd => PacketType::StepoverEnd,
        }
    }
}

/// Produce the buffer contents answering a test case request
///
/// The header of `buffer` is preserved, the payload is replaced and the
/// trigger byte is set to [`TriggerCode::DebuggerWrite`].
pub fn encode_testcase_request(
    buffer: &[u8; BUFFER_LEN],
    request: &TestcaseRequestPacket,
) -> Result<[u8; BUFFER_LEN], TracerError> {
    let mut out = *buffer;
    request.write(&mut Cursor::new(&mut out[PAYLOAD_OFFSET..]))?;
    out[TRIGGER_OFFSET] = TriggerCode::DebuggerWrite as u8;
    Ok(out)
}

/// Build a raw buffer as the target would write it
///
/// Used by the scripted target and tests to produce wire-exact packets.
pub fn encode_packet(packet: &Packet) -> Result<[u8; BUFFER_LEN], TracerError> {
    let mut out = [0u8; BUFFER_LEN];
    let mut writer = Cursor::new(&mut out[..]);
    PacketHeader {
        trigger: TriggerCode::TargetWrite as u8,
        tag: packet.packet_type() as u32,
    }
    .write(&mut writer)?;
    match packet {
        Packet::Allocation(p) => p.write(&mut writer)?,
        Packet::Free(p) => p.write(&mut writer)?,
        Packet::TestcaseRequest(p) => p.write(&mut writer)?,
        Packet::StackInfo(p) => p.write(&mut writer)?,
        Packet::TestcaseStart | Packet::TestcaseEnd | Packet::StepoverBegin | Packet::StepoverEnd => {}
    }
    Ok(out)
}

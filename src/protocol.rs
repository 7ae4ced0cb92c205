use std::time::Duration;

pub const TCPGECKO_PORT: u16 = 7331;
pub const BLOCK_SIZE: usize = 0x400;

/// Marker byte announcing a block of all-zero memory whose body is not sent.
pub const ZERO_BLOCK_MARKER: u8 = 0xB0;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Some homebrew servers drop the first request if it arrives right after accept.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Address of the three Wichmann-Hill state words (PAL build).
pub const RNG_STATE_ADDR_PAL: u32 = 0x1070_1BD4;
pub const RNG_STATE_LEN: u32 = 12;

pub const UDP_LOG_PORT: u16 = 4405;
pub const UDP_LOG_MAX_DATAGRAM: usize = 1400;

/// TCPGecko command bytes. Only [`Opcode::ReadMemory`] and
/// [`Opcode::GetVersionHash`] are ever sent by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum Opcode {
    Write8 = 0x01,
    Write16 = 0x02,
    Write32 = 0x03,
    ReadMemory = 0x04,
    ReadMemoryKernel = 0x05,
    ValidateAddressRange = 0x06,
    MemoryDisassemble = 0x08,
    ReadMemoryCompressed = 0x09,
    KernelWrite = 0x0B,
    KernelRead = 0x0C,
    TakeScreenShot = 0x0D,
    UploadMemory = 0x41,
    ServerStatus = 0x50,
    GetDataBufferSize = 0x51,
    ReadFile = 0x52,
    ReadDirectory = 0x53,
    ReplaceFile = 0x54,
    GetCodeHandlerAddress = 0x55,
    ReadThreads = 0x56,
    AccountIdentifier = 0x57,
    FollowPointer = 0x60,
    RemoteProcedureCall = 0x70,
    GetSymbol = 0x71,
    MemorySearch32 = 0x72,
    AdvancedMemorySearch = 0x73,
    ExecuteAssembly = 0x81,
    PauseConsole = 0x82,
    ResumeConsole = 0x83,
    IsConsolePaused = 0x84,
    ServerVersion = 0x99,
    GetOsVersion = 0x9A,
    SetDataBreakpoint = 0xA0,
    SetInstructionBreakpoint = 0xA2,
    ToggleBreakpoint = 0xA5,
    RemoveAllBreakpoints = 0xA6,
    PokeRegisters = 0xA7,
    GetStackTrace = 0xA8,
    GetEntryPointAddress = 0xB1,
    RunKernelCopyService = 0xCD,
    IosuHaxReadFile = 0xD0,
    GetVersionHash = 0xE0,
    PersistAssembly = 0xE1,
    ClearAssembly = 0xE2,
}

impl Opcode {
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Encode a `READ_MEMORY` request: opcode byte, then `start` and `end` as
/// big-endian `u32`s.
pub fn encode_read_request(start: u32, end: u32) -> [u8; 9] {
    let mut frame = [0u8; 9];
    frame[0] = Opcode::ReadMemory.as_byte();
    frame[1..5].copy_from_slice(&start.to_be_bytes());
    frame[5..9].copy_from_slice(&end.to_be_bytes());
    frame
}

/// Lengths of the response blocks for a read of `size` bytes: full blocks
/// first, then the remainder if there is one.
pub fn block_lengths(size: usize) -> impl Iterator<Item = usize> {
    let full = size / BLOCK_SIZE;
    let rest = size % BLOCK_SIZE;
    std::iter::repeat_n(BLOCK_SIZE, full).chain((rest > 0).then_some(rest))
}

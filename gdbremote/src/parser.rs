/// Remote protocol packet parser
///
/// This module turns decoded packet bodies into structured values: the
/// commands a server receives, and the replies a client receives.

use regex::Regex;

use crate::codec::{self, Codec};
use crate::types::*;
use crate::{Result, RspError};

/// A command received by the server stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `?`
    HaltReason,
    /// `g`
    ReadRegisters,
    /// `G<regdata>`
    WriteRegisters(Vec<u8>),
    /// `p<idx>`
    ReadRegister(usize),
    /// `P<idx>=<val>`
    WriteRegister { index: usize, value: Vec<u8> },
    /// `c[addr]`
    Continue(Option<u64>),
    /// `s[addr]`
    Step(Option<u64>),
    /// `m<addr>,<len>`
    ReadMemory { address: u64, length: usize },
    /// `M<addr>,<len>:<data>`
    WriteMemory { address: u64, data: Vec<u8> },
    /// `Z<type>,<addr>,<kind>`
    InsertBreakpoint { z_type: u8, address: u64, kind: u64 },
    /// `z<type>,<addr>,<kind>`
    RemoveBreakpoint { z_type: u8, address: u64, kind: u64 },
    /// `H<op><tid>`
    SetThread { op: u8, thread: ThreadId },
    /// `T<tid>`
    ThreadAlive(ThreadId),
    /// `D`
    Detach,
    /// `k`
    Kill,
    Query(Query),
    /// Anything outside the command set; answered with an empty packet
    Unsupported(String),
}

/// The `q`/`Q` namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Supported(Vec<String>),
    Xfer {
        object: String,
        annex: String,
        offset: usize,
        length: usize,
    },
    CurrentThread,
    ThreadInfoFirst,
    ThreadInfoNext,
    /// Legacy `qL<first><max><next>` thread listing
    LegacyThreadList {
        first: bool,
        max: usize,
        next: ThreadId,
    },
    TraceStatus,
    Attached,
    Offsets,
    Symbol,
    StartNoAckMode,
    PassSignals(Vec<u8>),
}

fn malformed(packet: &[u8]) -> RspError {
    RspError::Parse(String::from_utf8_lossy(packet).into_owned())
}

fn hex_field(field: &[u8], packet: &[u8]) -> Result<u64> {
    codec::parse_hex_u64(field).ok_or_else(|| malformed(packet))
}

/// Split `a,b` into its two halves
fn split_pair(data: &[u8], sep: u8) -> Option<(&[u8], &[u8])> {
    let pos = data.iter().position(|&b| b == sep)?;
    Some((&data[..pos], &data[pos + 1..]))
}

/// Parse a thread id: plain hex, `-1`, or multiprocess `p<pid>.<tid>`
pub fn parse_thread_id(data: &[u8]) -> Option<ThreadId> {
    let tid = match data.strip_prefix(b"p") {
        Some(rest) => match split_pair(rest, b'.') {
            Some((_pid, tid)) => tid,
            None => return Some(ThreadId::ANY),
        },
        None => data,
    };

    match tid {
        b"-1" => Some(ThreadId::ALL),
        _ => codec::parse_hex_u64(tid).map(|t| ThreadId(t as i64)),
    }
}

/// Parse a decoded packet body received by the server
pub fn parse_command(packet: &[u8]) -> Result<Command> {
    let Some((&head, rest)) = packet.split_first() else {
        return Ok(Command::Unsupported(String::new()));
    };

    let command = match head {
        b'?' => Command::HaltReason,
        b'g' => Command::ReadRegisters,
        b'G' => Command::WriteRegisters(rest.to_vec()),
        b'p' => Command::ReadRegister(hex_field(rest, packet)? as usize),
        b'P' => {
            let (index, value) = split_pair(rest, b'=').ok_or_else(|| malformed(packet))?;
            Command::WriteRegister {
                index: hex_field(index, packet)? as usize,
                value: value.to_vec(),
            }
        }
        b'c' | b's' => {
            let address = if rest.is_empty() {
                None
            } else {
                Some(hex_field(rest, packet)?)
            };
            if head == b'c' {
                Command::Continue(address)
            } else {
                Command::Step(address)
            }
        }
        b'm' => {
            let (address, length) = split_pair(rest, b',').ok_or_else(|| malformed(packet))?;
            Command::ReadMemory {
                address: hex_field(address, packet)?,
                length: hex_field(length, packet)? as usize,
            }
        }
        b'M' => {
            let (header, data) = split_pair(rest, b':').ok_or_else(|| malformed(packet))?;
            let (address, length) = split_pair(header, b',').ok_or_else(|| malformed(packet))?;
            let data = codec::decode_hex(data)?;
            if data.len() as u64 != hex_field(length, packet)? {
                return Err(malformed(packet));
            }
            Command::WriteMemory {
                address: hex_field(address, packet)?,
                data,
            }
        }
        b'Z' | b'z' => {
            let fields: Vec<&[u8]> = rest.split(|&b| b == b',').collect();
            if fields.len() < 3 {
                return Err(malformed(packet));
            }
            // Conditions and commands after the kind (`;X...`) are ignored.
            let kind_field = fields[2].split(|&b| b == b';').next().unwrap_or_default();
            let z_type = u8::try_from(hex_field(fields[0], packet)?).map_err(|_| malformed(packet))?;
            let address = hex_field(fields[1], packet)?;
            let kind = hex_field(kind_field, packet)?;
            if head == b'Z' {
                Command::InsertBreakpoint { z_type, address, kind }
            } else {
                Command::RemoveBreakpoint { z_type, address, kind }
            }
        }
        b'H' => {
            let (&op, thread) = rest.split_first().ok_or_else(|| malformed(packet))?;
            Command::SetThread {
                op,
                thread: parse_thread_id(thread).ok_or_else(|| malformed(packet))?,
            }
        }
        b'T' => Command::ThreadAlive(parse_thread_id(rest).ok_or_else(|| malformed(packet))?),
        b'D' => Command::Detach,
        b'k' => Command::Kill,
        b'q' | b'Q' => match parse_query(packet)? {
            Some(query) => Command::Query(query),
            None => Command::Unsupported(String::from_utf8_lossy(packet).into_owned()),
        },
        _ => Command::Unsupported(String::from_utf8_lossy(packet).into_owned()),
    };

    Ok(command)
}

fn parse_query(packet: &[u8]) -> Result<Option<Query>> {
    let text = std::str::from_utf8(packet).map_err(|_| malformed(packet))?;

    let query = if let Some(features) = text.strip_prefix("qSupported") {
        let features = features.strip_prefix(':').unwrap_or(features);
        Query::Supported(
            features
                .split(';')
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
        )
    } else if text.starts_with("qXfer:") {
        return parse_xfer_request(text).map(Some);
    } else if let Some(rest) = text.strip_prefix("qL") {
        let rest = rest.as_bytes();
        if rest.len() < 3 {
            return Err(malformed(packet));
        }
        Query::LegacyThreadList {
            first: rest[0] == b'1',
            max: hex_field(&rest[1..3], packet)? as usize,
            next: parse_thread_id(&rest[3..]).unwrap_or(ThreadId::ANY),
        }
    } else if let Some(signals) = text.strip_prefix("QPassSignals:") {
        let signals = signals
            .split(';')
            .filter(|s| !s.is_empty())
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| malformed(packet)))
            .collect::<Result<Vec<u8>>>()?;
        Query::PassSignals(signals)
    } else if text.starts_with("qSymbol") {
        Query::Symbol
    } else if text.starts_with("qAttached") {
        Query::Attached
    } else {
        match text {
            "qC" => Query::CurrentThread,
            "qfThreadInfo" => Query::ThreadInfoFirst,
            "qsThreadInfo" => Query::ThreadInfoNext,
            "qTStatus" => Query::TraceStatus,
            "qOffsets" => Query::Offsets,
            "QStartNoAckMode" => Query::StartNoAckMode,
            _ => return Ok(None),
        }
    };

    Ok(Some(query))
}

fn parse_xfer_request(text: &str) -> Result<Query> {
    let re = Regex::new(r"^qXfer:([A-Za-z-]+):read:([^:]*):([0-9a-fA-F]+),([0-9a-fA-F]+)$")
        .map_err(|e| RspError::Parse(format!("Regex error: {}", e)))?;

    let caps = re
        .captures(text)
        .ok_or_else(|| RspError::Parse(format!("Invalid qXfer request: {}", text)))?;

    let number = |i: usize| {
        usize::from_str_radix(&caps[i], 16)
            .map_err(|_| RspError::Parse(format!("Invalid qXfer request: {}", text)))
    };

    Ok(Query::Xfer {
        object: caps[1].to_string(),
        annex: caps[2].to_string(),
        offset: number(3)?,
        length: number(4)?,
    })
}

/// Fail on an `E<nn>` reply, pass anything else through
pub fn check_error(reply: &[u8]) -> Result<&[u8]> {
    if let [b'E', hi, lo] = reply {
        if let (Some(hi), Some(lo)) = (codec::hex_digit(*hi), codec::hex_digit(*lo)) {
            return Err(RspError::Target(hi << 4 | lo));
        }
    }
    Ok(reply)
}

/// Parse an `S`, `T`, `W` or `X` stop reply
pub fn parse_stop_reply(reply: &[u8], codec: &Codec) -> Result<StopReply> {
    let reply = check_error(reply)?;
    let unexpected = || RspError::UnexpectedReply(String::from_utf8_lossy(reply).into_owned());

    let (&kind, rest) = reply.split_first().ok_or_else(unexpected)?;
    if rest.len() < 2 {
        return Err(unexpected());
    }
    let code = codec::decode_hex(&rest[..2])
        .map_err(|_| unexpected())?
        .first()
        .copied()
        .ok_or_else(unexpected)?;

    match kind {
        b'S' => Ok(StopReply::Halted(HaltReason::signal(code))),
        b'W' => Ok(StopReply::Exited(code)),
        b'X' => Ok(StopReply::Terminated(code)),
        b'T' => {
            let mut reason = HaltReason::signal(code);
            let mut registers = RegisterMap::new();

            for pair in rest[2..].split(|&b| b == b';').filter(|p| !p.is_empty()) {
                let Some((key, value)) = split_pair(pair, b':') else {
                    continue;
                };
                if key == b"thread" {
                    reason.thread = parse_thread_id(value);
                    continue;
                }
                // Non-numeric keys (swbreak, watch, ...) carry no register.
                let Some(index) = codec::parse_hex_u64(key) else {
                    continue;
                };
                if let Some(register) = codec.layout().by_index(index as usize) {
                    registers.insert(register.name.clone(), codec.decode_register(value)?);
                }
            }

            if !registers.is_empty() {
                reason.registers = Some(registers);
            }
            Ok(StopReply::Halted(reason))
        }
        _ => Err(unexpected()),
    }
}

/// Render a halt as `S<sig>`, or `T<sig>` when registers or a thread are attached
pub fn format_stop_reply(reason: &HaltReason, codec: &Codec) -> String {
    if reason.registers.is_none() && reason.thread.is_none() {
        return format!("S{:02x}", reason.signal);
    }

    let mut reply = format!("T{:02x}", reason.signal);
    if let Some(registers) = &reason.registers {
        for register in codec.layout().iter() {
            if let Some(&value) = registers.get(&register.name) {
                reply.push_str(&format!(
                    "{:x}:{};",
                    register.wire_index,
                    codec.encode_register(register, value)
                ));
            }
        }
    }
    if let Some(thread) = reason.thread {
        reply.push_str(&format!("thread:{};", thread));
    }
    reply
}

/// Build a feature table from a `qSupported` reply
pub fn parse_features(reply: &[u8]) -> FeatureTable {
    let mut features = FeatureTable {
        supported: true,
        ..FeatureTable::default()
    };

    for token in String::from_utf8_lossy(reply).split(';').filter(|t| !t.is_empty()) {
        if !features.record(token) {
            log::debug!("Ignoring feature outside the negotiated set: {}", token);
        }
    }

    features
}

/// Parse a `qOffsets` reply
pub fn parse_offsets(reply: &[u8]) -> Result<SectionOffsets> {
    let text = std::str::from_utf8(reply)
        .map_err(|_| RspError::UnexpectedReply(String::from_utf8_lossy(reply).into_owned()))?;

    let re = Regex::new(r"(TextSeg|DataSeg|Text|Data|Bss)=([0-9a-fA-F]+)")
        .map_err(|e| RspError::Parse(format!("Regex error: {}", e)))?;

    let mut text_offset = None;
    let mut offsets = SectionOffsets::default();
    for caps in re.captures_iter(text) {
        let value = u64::from_str_radix(&caps[2], 16)
            .map_err(|_| RspError::UnexpectedReply(text.to_string()))?;
        match &caps[1] {
            "Text" | "TextSeg" => text_offset = Some(value),
            "Data" | "DataSeg" => offsets.data = value,
            "Bss" => offsets.bss = Some(value),
            _ => {}
        }
    }

    offsets.text = text_offset.ok_or_else(|| RspError::UnexpectedReply(text.to_string()))?;
    Ok(offsets)
}

/// Parse a `QC<tid>` reply
pub fn parse_current_thread(reply: &[u8]) -> Option<ThreadId> {
    reply.strip_prefix(b"QC").and_then(parse_thread_id)
}

/// Parse a `qfThreadInfo`/`qsThreadInfo` reply into ids and an end-of-list flag
pub fn parse_thread_list(reply: &[u8]) -> Result<(Vec<ThreadId>, bool)> {
    let unexpected = || RspError::UnexpectedReply(String::from_utf8_lossy(reply).into_owned());

    match reply.split_first() {
        Some((b'l', _)) => Ok((Vec::new(), true)),
        Some((b'm', ids)) => {
            let ids = ids
                .split(|&b| b == b',')
                .map(|id| parse_thread_id(id).ok_or_else(unexpected))
                .collect::<Result<Vec<_>>>()?;
            Ok((ids, false))
        }
        _ => Err(unexpected()),
    }
}

/// A decoded legacy `qM` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyThreadBatch {
    pub threads: Vec<ThreadId>,
    pub done: bool,
    pub next: ThreadId,
}

/// Parse `qM<count:2><done:1><arg:16><ids:16...>`
pub fn parse_legacy_thread_list(reply: &[u8]) -> Result<LegacyThreadBatch> {
    let unexpected = || RspError::UnexpectedReply(String::from_utf8_lossy(reply).into_owned());

    let body = reply.strip_prefix(b"qM").ok_or_else(unexpected)?;
    if body.len() < 19 {
        return Err(unexpected());
    }
    let count = codec::parse_hex_u64(&body[..2]).ok_or_else(unexpected)? as usize;
    let done = body[2] == b'1';
    let next = parse_thread_id(&body[3..19]).ok_or_else(unexpected)?;

    let ids = &body[19..];
    if ids.len() < count * 16 {
        return Err(unexpected());
    }
    let threads = ids
        .chunks(16)
        .take(count)
        .map(|id| parse_thread_id(id).ok_or_else(unexpected))
        .collect::<Result<Vec<_>>>()?;

    Ok(LegacyThreadBatch { threads, done, next })
}

/// Render a legacy `qM` reply
pub fn format_legacy_thread_list(batch: &LegacyThreadBatch) -> String {
    let mut reply = format!(
        "qM{:02x}{}{:016x}",
        batch.threads.len(),
        if batch.done { 1 } else { 0 },
        batch.next.0.max(0)
    );
    for thread in &batch.threads {
        reply.push_str(&format!("{:016x}", thread.0.max(0)));
    }
    reply
}

/// Parse a `qXfer` reply chunk into its payload and last-chunk flag
pub fn parse_xfer_chunk(reply: &[u8]) -> Result<(Vec<u8>, bool)> {
    let reply = check_error(reply)?;
    match reply.split_first() {
        Some((b'l', data)) => Ok((codec::unescape_binary(data), true)),
        Some((b'm', data)) => Ok((codec::unescape_binary(data), false)),
        _ => Err(RspError::UnexpectedReply(String::from_utf8_lossy(reply).into_owned())),
    }
}

/// `O<hex>` console output sent by the target while it runs
pub fn parse_console_output(reply: &[u8]) -> Option<String> {
    if reply == b"OK" {
        return None;
    }
    let hex = reply.strip_prefix(b"O")?;
    if hex.is_empty() {
        return None;
    }
    codec::decode_hex(hex)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::new(RegisterLayout::new([("r0", 32), ("sp", 32), ("pc", 32)]), Endian::Little)
    }

    #[test]
    fn test_parse_memory_commands() {
        assert_eq!(
            parse_command(b"m1000,4").unwrap(),
            Command::ReadMemory { address: 0x1000, length: 4 }
        );
        assert_eq!(
            parse_command(b"M2000,2:beef").unwrap(),
            Command::WriteMemory { address: 0x2000, data: vec![0xbe, 0xef] }
        );
        assert!(parse_command(b"M2000,3:beef").is_err());
        assert!(parse_command(b"mzz,4").is_err());
    }

    #[test]
    fn test_parse_register_commands() {
        assert_eq!(parse_command(b"p1f").unwrap(), Command::ReadRegister(0x1f));
        assert_eq!(
            parse_command(b"P2=10400000").unwrap(),
            Command::WriteRegister { index: 2, value: b"10400000".to_vec() }
        );
        assert_eq!(parse_command(b"g").unwrap(), Command::ReadRegisters);
    }

    #[test]
    fn test_parse_execution_commands() {
        assert_eq!(parse_command(b"c").unwrap(), Command::Continue(None));
        assert_eq!(parse_command(b"c4010").unwrap(), Command::Continue(Some(0x4010)));
        assert_eq!(parse_command(b"s").unwrap(), Command::Step(None));
        assert_eq!(parse_command(b"D").unwrap(), Command::Detach);
        assert_eq!(parse_command(b"k").unwrap(), Command::Kill);
    }

    #[test]
    fn test_parse_breakpoint_commands() {
        assert_eq!(
            parse_command(b"Z0,4010,0").unwrap(),
            Command::InsertBreakpoint { z_type: 0, address: 0x4010, kind: 0 }
        );
        assert_eq!(
            parse_command(b"z1,8000,2;X1,aa").unwrap(),
            Command::RemoveBreakpoint { z_type: 1, address: 0x8000, kind: 2 }
        );
        assert!(parse_command(b"Z0,4010").is_err());
        assert!(parse_command(b"Z100,4010,0").is_err());
        assert!(parse_command(b"z101,4010,0").is_err());
    }

    #[test]
    fn test_parse_thread_commands() {
        assert_eq!(
            parse_command(b"Hg-1").unwrap(),
            Command::SetThread { op: b'g', thread: ThreadId::ALL }
        );
        assert_eq!(
            parse_command(b"Hcp1.2").unwrap(),
            Command::SetThread { op: b'c', thread: ThreadId(2) }
        );
        assert_eq!(parse_command(b"T5").unwrap(), Command::ThreadAlive(ThreadId(5)));
    }

    #[test]
    fn test_parse_queries() {
        assert_eq!(
            parse_command(b"qSupported:multiprocess+;swbreak+").unwrap(),
            Command::Query(Query::Supported(vec!["multiprocess+".into(), "swbreak+".into()]))
        );
        assert_eq!(parse_command(b"qC").unwrap(), Command::Query(Query::CurrentThread));
        assert_eq!(parse_command(b"qAttached:1").unwrap(), Command::Query(Query::Attached));
        assert_eq!(parse_command(b"qSymbol::").unwrap(), Command::Query(Query::Symbol));
        assert_eq!(
            parse_command(b"QPassSignals:e;14").unwrap(),
            Command::Query(Query::PassSignals(vec![0x0e, 0x14]))
        );
        assert_eq!(
            parse_command(b"qL1200000000000000000").unwrap(),
            Command::Query(Query::LegacyThreadList { first: true, max: 0x20, next: ThreadId(0) })
        );
    }

    #[test]
    fn test_parse_xfer_request() {
        assert_eq!(
            parse_command(b"qXfer:features:read:target.xml:0,7ff").unwrap(),
            Command::Query(Query::Xfer {
                object: "features".into(),
                annex: "target.xml".into(),
                offset: 0,
                length: 0x7ff,
            })
        );
        assert!(parse_command(b"qXfer:features:read:target.xml").is_err());
    }

    #[test]
    fn test_unknown_commands_are_unsupported() {
        assert!(matches!(parse_command(b"vMustReplyEmpty").unwrap(), Command::Unsupported(_)));
        assert!(matches!(parse_command(b"qRcmd,7265736574").unwrap(), Command::Unsupported(_)));
        assert!(matches!(parse_command(b"").unwrap(), Command::Unsupported(_)));
    }

    #[test]
    fn test_check_error() {
        assert!(matches!(check_error(b"E0e"), Err(RspError::Target(0x0e))));
        assert_eq!(check_error(b"ef").unwrap(), b"ef");
        assert_eq!(check_error(b"OK").unwrap(), b"OK");
    }

    #[test]
    fn test_parse_stop_replies() {
        let codec = codec();

        assert_eq!(
            parse_stop_reply(b"S05", &codec).unwrap(),
            StopReply::Halted(HaltReason::signal(5))
        );
        assert_eq!(parse_stop_reply(b"W00", &codec).unwrap(), StopReply::Exited(0));
        assert_eq!(parse_stop_reply(b"X09", &codec).unwrap(), StopReply::Terminated(9));
        assert!(parse_stop_reply(b"OK", &codec).is_err());
    }

    #[test]
    fn test_parse_t_stop_reply() {
        let codec = codec();
        let stop = parse_stop_reply(b"T052:10400000;thread:1;swbreak:;", &codec).unwrap();

        let StopReply::Halted(reason) = stop else {
            panic!("Expected halt");
        };
        assert_eq!(reason.signal, 5);
        assert_eq!(reason.thread, Some(ThreadId(1)));
        assert_eq!(reason.registers.unwrap()["pc"], 0x4010);
    }

    #[test]
    fn test_format_stop_reply_round_trips() {
        let codec = codec();
        let mut registers = RegisterMap::new();
        registers.insert("pc".into(), 0x4010);
        let reason = HaltReason {
            signal: 5,
            registers: Some(registers),
            thread: Some(ThreadId(1)),
        };

        let reply = format_stop_reply(&reason, &codec);
        assert_eq!(reply, "T052:10400000;thread:1;");
        assert_eq!(
            parse_stop_reply(reply.as_bytes(), &codec).unwrap(),
            StopReply::Halted(reason)
        );
        assert_eq!(format_stop_reply(&HaltReason::signal(2), &codec), "S02");
    }

    #[test]
    fn test_parse_offsets() {
        let offsets = parse_offsets(b"Text=1000;Data=2000;Bss=2000").unwrap();
        assert_eq!(offsets.text, 0x1000);
        assert_eq!(offsets.data, 0x2000);
        assert_eq!(offsets.bss, Some(0x2000));
        assert_eq!(offsets.relocate(0x10), 0x1010);

        let segments = parse_offsets(b"TextSeg=400000").unwrap();
        assert_eq!(segments.text, 0x400000);
        assert_eq!(segments.bss, None);

        assert!(parse_offsets(b"Data=1").is_err());
    }

    #[test]
    fn test_parse_thread_lists() {
        assert_eq!(
            parse_thread_list(b"m1,2,1f").unwrap(),
            (vec![ThreadId(1), ThreadId(2), ThreadId(0x1f)], false)
        );
        assert_eq!(parse_thread_list(b"l").unwrap(), (vec![], true));
        assert_eq!(parse_current_thread(b"QC2a"), Some(ThreadId(0x2a)));
    }

    #[test]
    fn test_legacy_thread_list_round_trips() {
        let batch = LegacyThreadBatch {
            threads: vec![ThreadId(1), ThreadId(7)],
            done: true,
            next: ThreadId(0),
        };
        let reply = format_legacy_thread_list(&batch);

        assert_eq!(&reply[..5], "qM021");
        assert_eq!(parse_legacy_thread_list(reply.as_bytes()).unwrap(), batch);
    }

    #[test]
    fn test_parse_xfer_chunk() {
        assert_eq!(parse_xfer_chunk(b"m<tar").unwrap(), (b"<tar".to_vec(), false));
        assert_eq!(parse_xfer_chunk(b"l}\x03").unwrap(), (b"#".to_vec(), true));
        assert!(matches!(parse_xfer_chunk(b"E00"), Err(RspError::Target(0))));
    }

    #[test]
    fn test_parse_console_output() {
        assert_eq!(parse_console_output(b"O68690a"), Some("hi\n".to_string()));
        assert_eq!(parse_console_output(b"OK"), None);
        assert_eq!(parse_console_output(b"S05"), None);
    }
}

//! Default service handlers
//!
//! Each handler is total: it inspects the raw payload, consults or mutates
//! the engine state, and always produces a well-formed response. Failures
//! are protocol outcomes, never process faults.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use udslab_proto::codec::{self, CodecError};
use udslab_proto::{
    ddid_sub_function, device_nrc, reset_type, security_sub_function, service_id,
    NegativeResponseCode, ServiceResponse,
};

use crate::builtin::{RecordGuard, RecordSource};
use crate::dynamic::Segment;
use crate::engine::{EngineInner, ServiceHandler};
use crate::memory::MemoryError;
use crate::security::{SecurityError, SessionLevel};

/// Resolution depth budget for identifier-to-identifier indirection. The
/// defining service rejects direct self-reference; the budget keeps hostile
/// mutual definitions a protocol error instead of unbounded recursion.
const MAX_RESOLVE_DEPTH: usize = 8;

/// The default service table.
pub(crate) fn default_handlers() -> HashMap<u8, ServiceHandler> {
    let mut table: HashMap<u8, ServiceHandler> = HashMap::new();
    table.insert(
        service_id::DIAGNOSTIC_SESSION_CONTROL,
        Arc::new(session_control),
    );
    table.insert(service_id::ECU_RESET, Arc::new(ecu_reset));
    table.insert(service_id::SECURITY_ACCESS, Arc::new(security_access));
    table.insert(
        service_id::READ_MEMORY_BY_ADDRESS,
        Arc::new(read_memory_by_address),
    );
    table.insert(
        service_id::WRITE_MEMORY_BY_ADDRESS,
        Arc::new(write_memory_by_address),
    );
    table.insert(
        service_id::READ_DATA_BY_ID,
        Arc::new(read_data_by_identifier),
    );
    table.insert(
        service_id::DYNAMICALLY_DEFINE_DATA_ID,
        Arc::new(dynamically_define_data_identifier),
    );
    table
}

fn security_nrc(err: SecurityError) -> NegativeResponseCode {
    match err {
        SecurityError::ExceededNumberOfAttempts => NegativeResponseCode::ExceededNumberOfAttempts,
        SecurityError::RequestSequenceError => NegativeResponseCode::RequestSequenceError,
        SecurityError::InvalidKey => NegativeResponseCode::InvalidKey,
        SecurityError::SecurityAccessDenied => NegativeResponseCode::SecurityAccessDenied,
        SecurityError::SubFunctionNotSupported => NegativeResponseCode::SubFunctionNotSupported,
    }
}

fn memory_nrc(err: MemoryError) -> NegativeResponseCode {
    match err {
        MemoryError::OutOfBounds => NegativeResponseCode::RequestOutOfRange,
        MemoryError::AccessDenied => NegativeResponseCode::SecurityAccessDenied,
    }
}

// =============================================================================
// DiagnosticSessionControl (0x10)
// =============================================================================

fn session_control(inner: &mut EngineInner, payload: &[u8]) -> ServiceResponse {
    let sid = service_id::DIAGNOSTIC_SESSION_CONTROL;
    if payload.len() != 1 {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    }

    match inner.state.request_session(payload[0]) {
        Ok(level) => {
            info!(session = format!("0x{:02X}", level.code()), "Session changed");
            ServiceResponse::positive(sid, vec![level.code()])
        }
        Err(e) => {
            debug!(target_session = format!("0x{:02X}", payload[0]), %e, "Session change refused");
            ServiceResponse::negative(sid, security_nrc(e))
        }
    }
}

// =============================================================================
// ECUReset (0x11)
// =============================================================================

fn ecu_reset(inner: &mut EngineInner, payload: &[u8]) -> ServiceResponse {
    let sid = service_id::ECU_RESET;
    if payload.len() != 1 {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    }

    match payload[0] {
        reset_type::HARD_RESET | reset_type::KEY_OFF_ON_RESET => {
            inner.state.reset(&inner.policy);
            info!(
                reset_type = format!("0x{:02X}", payload[0]),
                attempts_cleared = inner.policy.clear_attempts_on_reset,
                "ECU reset"
            );
            ServiceResponse::positive(sid, vec![payload[0]])
        }
        other => {
            debug!(reset_type = format!("0x{:02X}", other), "Unsupported reset type");
            ServiceResponse::negative(sid, NegativeResponseCode::SubFunctionNotSupported)
        }
    }
}

// =============================================================================
// SecurityAccess (0x27)
// =============================================================================

fn security_access(inner: &mut EngineInner, payload: &[u8]) -> ServiceResponse {
    let sid = service_id::SECURITY_ACCESS;
    let Some(&sub_function) = payload.first() else {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    };

    match sub_function {
        security_sub_function::REQUEST_SEED => {
            if payload.len() != 1 {
                return ServiceResponse::negative(
                    sid,
                    NegativeResponseCode::IncorrectMessageLengthOrFormat,
                );
            }
            match inner.state.request_seed(&inner.policy) {
                Ok(seed) => {
                    info!("Security access: seed issued");
                    let mut data = vec![security_sub_function::REQUEST_SEED];
                    data.extend_from_slice(&seed);
                    ServiceResponse::positive(sid, data)
                }
                Err(e) => {
                    debug!(%e, "Security access: seed refused");
                    ServiceResponse::negative(sid, security_nrc(e))
                }
            }
        }
        security_sub_function::SEND_KEY => {
            let key = &payload[1..];
            let strategy = inner.strategy.clone();
            match inner.state.submit_key(strategy.as_ref(), key) {
                Ok(()) => {
                    info!("Security access: key accepted, device unlocked");
                    ServiceResponse::positive(sid, vec![security_sub_function::SEND_KEY])
                }
                Err(e) => {
                    debug!(
                        %e,
                        failed_attempts = inner.state.failed_attempts,
                        "Security access: key rejected"
                    );
                    ServiceResponse::negative(sid, security_nrc(e))
                }
            }
        }
        other => {
            debug!(
                sub_function = format!("0x{:02X}", other),
                "Security access: unknown sub-function"
            );
            ServiceResponse::negative(sid, NegativeResponseCode::RequestSequenceError)
        }
    }
}

// =============================================================================
// ReadMemoryByAddress (0x23) / WriteMemoryByAddress (0x3D)
// =============================================================================

/// Decoded `[format][address][length]` header plus whatever follows it
struct MemoryRequest<'a> {
    format: u8,
    address: u64,
    address_width: usize,
    length: u64,
    length_width: usize,
    rest: &'a [u8],
}

fn parse_memory_request(payload: &[u8]) -> Result<MemoryRequest<'_>, CodecError> {
    let (head, rest) = codec::pop_fixed(payload, 1)?;
    let format = head[0];
    let widths = codec::parse_address_length_format(format)?;
    let (addr_bytes, rest) = codec::pop_fixed(rest, widths.address_size)?;
    let (len_bytes, rest) = codec::pop_fixed(rest, widths.length_size)?;
    Ok(MemoryRequest {
        format,
        address: codec::decode_unsigned(addr_bytes)?,
        address_width: widths.address_size,
        length: codec::decode_unsigned(len_bytes)?,
        length_width: widths.length_size,
        rest,
    })
}

fn read_memory_by_address(inner: &mut EngineInner, payload: &[u8]) -> ServiceResponse {
    let sid = service_id::READ_MEMORY_BY_ADDRESS;
    let Ok(req) = parse_memory_request(payload) else {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    };
    if !req.rest.is_empty() {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    }

    match inner.memory.read(req.address, req.length) {
        Ok(bytes) => {
            debug!(
                address = format!("0x{:X}", req.address),
                length = req.length,
                "Memory read"
            );
            ServiceResponse::positive(sid, bytes.to_vec())
        }
        Err(e) => {
            debug!(
                address = format!("0x{:X}", req.address),
                length = req.length,
                %e,
                "Memory read refused"
            );
            ServiceResponse::negative(sid, memory_nrc(e))
        }
    }
}

fn write_memory_by_address(inner: &mut EngineInner, payload: &[u8]) -> ServiceResponse {
    let sid = service_id::WRITE_MEMORY_BY_ADDRESS;
    let Ok(req) = parse_memory_request(payload) else {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    };

    if req.rest.len() as u64 != req.length {
        debug!(
            declared = req.length,
            supplied = req.rest.len(),
            "Memory write length mismatch"
        );
        return ServiceResponse::negative(
            sid,
            NegativeResponseCode::Unknown(device_nrc::DATA_LENGTH_MISMATCH),
        );
    }

    match inner.memory.write(req.address, req.rest) {
        Ok(()) => {
            debug!(
                address = format!("0x{:X}", req.address),
                length = req.length,
                "Memory write"
            );
            // echo [format][address][length]
            let mut data = vec![req.format];
            data.extend_from_slice(&codec::encode_unsigned(req.address, req.address_width));
            data.extend_from_slice(&codec::encode_unsigned(req.length, req.length_width));
            ServiceResponse::positive(sid, data)
        }
        Err(e) => {
            debug!(
                address = format!("0x{:X}", req.address),
                length = req.length,
                %e,
                "Memory write refused"
            );
            ServiceResponse::negative(sid, memory_nrc(e))
        }
    }
}

// =============================================================================
// ReadDataByIdentifier (0x22)
// =============================================================================

fn read_data_by_identifier(inner: &mut EngineInner, payload: &[u8]) -> ServiceResponse {
    let sid = service_id::READ_DATA_BY_ID;
    match resolve_read(inner, payload, MAX_RESOLVE_DEPTH) {
        Ok(data) => ServiceResponse::positive(sid, data),
        Err(nrc) => ServiceResponse::negative(sid, nrc),
    }
}

/// Resolve a sequence of 2-byte identifiers into `[id][record]...` response
/// data. Built-in records win over dynamic definitions; identifiers that
/// match neither contribute nothing.
fn resolve_read(
    inner: &EngineInner,
    payload: &[u8],
    depth: usize,
) -> Result<Vec<u8>, NegativeResponseCode> {
    if payload.len() % 2 != 0 {
        return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat);
    }

    let mut out = Vec::new();
    for pair in payload.chunks_exact(2) {
        let did = u16::from_be_bytes([pair[0], pair[1]]);

        if let Some(record) = inner.builtins.iter().find(|r| r.did == did) {
            check_guard(inner, record.guard)?;
            let bytes = match &record.source {
                RecordSource::Fixed(bytes) => bytes.clone(),
                RecordSource::Memory { addr, len: Some(n) } => inner
                    .memory
                    .read(*addr, *n)
                    .map_err(|_| NegativeResponseCode::RequestOutOfRange)?
                    .to_vec(),
                RecordSource::Memory { addr, len: None } => {
                    inner.memory.read_null_terminated(*addr).to_vec()
                }
            };
            out.extend_from_slice(&did.to_be_bytes());
            out.extend_from_slice(&bytes);
            continue;
        }

        if inner.dynamic.is_defined(did) {
            let resolved = resolve_dynamic(inner, did, depth)?;
            out.extend_from_slice(&did.to_be_bytes());
            out.extend_from_slice(&resolved);
        }
    }

    if out.is_empty() {
        return Err(NegativeResponseCode::RequestOutOfRange);
    }
    Ok(out)
}

fn check_guard(inner: &EngineInner, guard: RecordGuard) -> Result<(), NegativeResponseCode> {
    match guard {
        RecordGuard::None => Ok(()),
        RecordGuard::ExtendedAndUnlocked => {
            if !inner.state.is_unlocked() {
                return Err(NegativeResponseCode::SecurityAccessDenied);
            }
            if inner.state.session != SessionLevel::Extended {
                return Err(NegativeResponseCode::ConditionsNotCorrect);
            }
            Ok(())
        }
    }
}

/// Concatenate a dynamic identifier's segments. Every failure below this
/// point surfaces as RequestOutOfRange for the identifier being read.
fn resolve_dynamic(
    inner: &EngineInner,
    did: u16,
    depth: usize,
) -> Result<Vec<u8>, NegativeResponseCode> {
    if depth == 0 {
        return Err(NegativeResponseCode::RequestOutOfRange);
    }

    let mut out = Vec::new();
    for segment in inner.dynamic.segments(did) {
        match *segment {
            Segment::ByMemory { address, length } => {
                let bytes = inner
                    .memory
                    .read(address, length)
                    .map_err(|_| NegativeResponseCode::RequestOutOfRange)?;
                out.extend_from_slice(bytes);
            }
            Segment::ByIdentifier {
                source,
                position,
                size,
            } => {
                // the source's full response content, status byte stripped
                let content = resolve_read(inner, &source.to_be_bytes(), depth - 1)
                    .map_err(|_| NegativeResponseCode::RequestOutOfRange)?;
                let start = usize::from(position.saturating_sub(1));
                let sliced = if size == 0 {
                    content.get(start..)
                } else {
                    content.get(start..start + usize::from(size))
                };
                out.extend_from_slice(sliced.ok_or(NegativeResponseCode::RequestOutOfRange)?);
            }
        }
    }
    Ok(out)
}

// =============================================================================
// DynamicallyDefineDataIdentifier (0x2C)
// =============================================================================

fn dynamically_define_data_identifier(inner: &mut EngineInner, payload: &[u8]) -> ServiceResponse {
    let sid = service_id::DYNAMICALLY_DEFINE_DATA_ID;
    let Some(&sub_function) = payload.first() else {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    };

    match sub_function {
        ddid_sub_function::DEFINE_BY_IDENTIFIER => define_by_identifier(inner, &payload[1..]),
        ddid_sub_function::DEFINE_BY_MEMORY_ADDRESS => define_by_memory(inner, &payload[1..]),
        ddid_sub_function::CLEAR_DYNAMICALLY_DEFINED_DATA_IDENTIFIER => {
            clear_dynamic(inner, &payload[1..])
        }
        other => {
            debug!(
                sub_function = format!("0x{:02X}", other),
                "Unsupported define sub-function"
            );
            ServiceResponse::negative(sid, NegativeResponseCode::SubFunctionNotSupported)
        }
    }
}

/// Fixed 6-byte records: `[ddid][sourceDid][position][size]`.
fn define_by_identifier(inner: &mut EngineInner, records: &[u8]) -> ServiceResponse {
    let sid = service_id::DYNAMICALLY_DEFINE_DATA_ID;
    if records.is_empty() || records.len() % 6 != 0 {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    }

    // validate everything before touching the registry
    let mut parsed = Vec::with_capacity(records.len() / 6);
    for record in records.chunks_exact(6) {
        let ddid = u16::from_be_bytes([record[0], record[1]]);
        let source = u16::from_be_bytes([record[2], record[3]]);
        if source == ddid {
            debug!(
                ddid = format!("0x{:04X}", ddid),
                "Define rejected: identifier sources itself"
            );
            return ServiceResponse::negative(sid, NegativeResponseCode::RequestOutOfRange);
        }
        parsed.push((
            ddid,
            Segment::ByIdentifier {
                source,
                position: record[4],
                size: record[5],
            },
        ));
    }

    let first = parsed[0].0;
    for (ddid, segment) in parsed {
        if inner.dynamic.define(ddid, segment).is_err() {
            return ServiceResponse::negative(sid, NegativeResponseCode::RequestOutOfRange);
        }
    }

    info!(ddid = format!("0x{:04X}", first), "Dynamic identifier defined by identifier");
    let mut data = vec![ddid_sub_function::DEFINE_BY_IDENTIFIER];
    data.extend_from_slice(&first.to_be_bytes());
    ServiceResponse::positive(sid, data)
}

/// `[ddid][format]` then one or more `[address][length]` records, all
/// governed by the single format byte.
fn define_by_memory(inner: &mut EngineInner, records: &[u8]) -> ServiceResponse {
    let sid = service_id::DYNAMICALLY_DEFINE_DATA_ID;
    if records.len() < 3 {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    }

    let ddid = u16::from_be_bytes([records[0], records[1]]);
    let Ok(widths) = codec::parse_address_length_format(records[2]) else {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    };

    let mut cursor = &records[3..];
    if cursor.is_empty() {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    }

    let mut segments = Vec::new();
    while !cursor.is_empty() {
        let parsed = codec::pop_fixed(cursor, widths.address_size).and_then(|(addr, rest)| {
            codec::pop_fixed(rest, widths.length_size).and_then(|(len, rest)| {
                Ok((codec::decode_unsigned(addr)?, codec::decode_unsigned(len)?, rest))
            })
        });
        let Ok((address, length, rest)) = parsed else {
            return ServiceResponse::negative(
                sid,
                NegativeResponseCode::IncorrectMessageLengthOrFormat,
            );
        };
        segments.push(Segment::ByMemory { address, length });
        cursor = rest;
    }

    for segment in segments {
        if inner.dynamic.define(ddid, segment).is_err() {
            return ServiceResponse::negative(sid, NegativeResponseCode::RequestOutOfRange);
        }
    }

    info!(ddid = format!("0x{:04X}", ddid), "Dynamic identifier defined by memory address");
    let mut data = vec![ddid_sub_function::DEFINE_BY_MEMORY_ADDRESS];
    data.extend_from_slice(&ddid.to_be_bytes());
    ServiceResponse::positive(sid, data)
}

fn clear_dynamic(inner: &mut EngineInner, records: &[u8]) -> ServiceResponse {
    let sid = service_id::DYNAMICALLY_DEFINE_DATA_ID;
    if records.len() != 2 {
        return ServiceResponse::negative(sid, NegativeResponseCode::IncorrectMessageLengthOrFormat);
    }

    let ddid = u16::from_be_bytes([records[0], records[1]]);
    let removed = inner.dynamic.clear(ddid);
    if removed == 0 {
        debug!(ddid = format!("0x{:04X}", ddid), "Clear of undefined identifier");
        return ServiceResponse::negative(sid, NegativeResponseCode::RequestOutOfRange);
    }

    info!(
        ddid = format!("0x{:04X}", ddid),
        removed, "Dynamic identifier cleared"
    );
    let mut data = vec![ddid_sub_function::CLEAR_DYNAMICALLY_DEFINED_DATA_IDENTIFIER];
    data.extend_from_slice(&ddid.to_be_bytes());
    ServiceResponse::positive(sid, data)
}

//! Method body parsing: tiny/fat headers and exception-handling sections.

use crate::error::{JitError, Result};
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// Fat-header flag bits.
    pub struct BodyFlags: u16 {
        const MORE_SECTS = 0x0008;
        const INIT_LOCALS = 0x0010;
    }
}

// EH clause kinds.
pub const EH_CLAUSE_EXCEPTION: u32 = 0x0;
pub const EH_CLAUSE_FILTER: u32 = 0x1;
pub const EH_CLAUSE_FINALLY: u32 = 0x2;
pub const EH_CLAUSE_FAULT: u32 = 0x4;

// Section kind bits.
const SECT_EH_TABLE: u8 = 0x01;
const SECT_FAT_FORMAT: u8 = 0x40;
const SECT_MORE_SECTS: u8 = 0x80;

/// One exception-handling clause, kept in the shape the runtime's dispatcher
/// registration consumes. Funclet emission is outside the Tier-0 surface;
/// clauses are parsed and carried through to registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhClause {
    pub kind: u32,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
    /// Catch class token, or filter code offset for filter clauses.
    pub class_token_or_filter: u32,
}

/// Parsed method body.
#[derive(Debug)]
pub struct MethodBody<'a> {
    pub max_stack: u16,
    pub local_sig_token: u32,
    pub init_locals: bool,
    pub code: &'a [u8],
    pub eh_clauses: Vec<EhClause>,
}

/// Parses the header at a method's RVA, the IL span, and any EH sections.
pub fn parse_method_body(data: &[u8]) -> Result<MethodBody<'_>> {
    let first = *data.first().ok_or(JitError::MalformedHeader)?;

    // Tiny format: two low bits 10, size in the upper six.
    if first & 0x3 == 0x2 {
        let code_size = (first >> 2) as usize;
        let code = data.get(1..1 + code_size).ok_or(JitError::MalformedHeader)?;
        return Ok(MethodBody {
            max_stack: 8,
            local_sig_token: 0,
            init_locals: false,
            code,
            eh_clauses: Vec::new(),
        });
    }

    if first & 0x3 != 0x3 {
        return Err(JitError::MalformedHeader);
    }

    // Fat format.
    if data.len() < 12 {
        return Err(JitError::MalformedHeader);
    }
    let flags_and_size = u16::from_le_bytes([data[0], data[1]]);
    let flags = BodyFlags::from_bits_truncate(flags_and_size & 0x0FFF);
    let header_size = ((flags_and_size >> 12) as usize) * 4;
    if header_size < 12 {
        return Err(JitError::MalformedHeader);
    }
    let max_stack = u16::from_le_bytes([data[2], data[3]]);
    let code_size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let local_sig_token = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);

    let code = data
        .get(header_size..header_size + code_size)
        .ok_or(JitError::MalformedHeader)?;

    let mut eh_clauses = Vec::new();
    if flags.contains(BodyFlags::MORE_SECTS) {
        // Sections start at the next 4-byte boundary past the code.
        let mut offset = (header_size + code_size + 3) & !3;
        loop {
            let kind = *data.get(offset).ok_or(JitError::CorruptEhSection)?;
            let more = kind & SECT_MORE_SECTS != 0;
            if kind & SECT_EH_TABLE == 0 {
                return Err(JitError::CorruptEhSection);
            }
            offset = parse_eh_section(data, offset, kind, &mut eh_clauses)?;
            if !more {
                break;
            }
            offset = (offset + 3) & !3;
        }
    }

    Ok(MethodBody {
        max_stack,
        local_sig_token,
        init_locals: flags.contains(BodyFlags::INIT_LOCALS),
        code,
        eh_clauses,
    })
}

fn parse_eh_section(
    data: &[u8],
    start: usize,
    kind: u8,
    clauses: &mut Vec<EhClause>,
) -> Result<usize> {
    let section = data.get(start..).ok_or(JitError::CorruptEhSection)?;
    if kind & SECT_FAT_FORMAT != 0 {
        if section.len() < 4 {
            return Err(JitError::CorruptEhSection);
        }
        let data_size =
            u32::from_le_bytes([section[1], section[2], section[3], 0]) as usize;
        let count = data_size.checked_sub(4).ok_or(JitError::CorruptEhSection)? / 24;
        let body = section.get(4..data_size).ok_or(JitError::CorruptEhSection)?;
        for clause in 0..count {
            let c = &body[clause * 24..clause * 24 + 24];
            clauses.push(EhClause {
                kind: read_u32(c, 0),
                try_offset: read_u32(c, 4),
                try_length: read_u32(c, 8),
                handler_offset: read_u32(c, 12),
                handler_length: read_u32(c, 16),
                class_token_or_filter: read_u32(c, 20),
            });
        }
        Ok(start + data_size)
    } else {
        if section.len() < 4 {
            return Err(JitError::CorruptEhSection);
        }
        let data_size = section[1] as usize;
        let count = data_size.checked_sub(4).ok_or(JitError::CorruptEhSection)? / 12;
        let body = section.get(4..data_size).ok_or(JitError::CorruptEhSection)?;
        for clause in 0..count {
            let c = &body[clause * 12..clause * 12 + 12];
            clauses.push(EhClause {
                kind: u16::from_le_bytes([c[0], c[1]]) as u32,
                try_offset: u16::from_le_bytes([c[2], c[3]]) as u32,
                try_length: c[4] as u32,
                handler_offset: u16::from_le_bytes([c[5], c[6]]) as u32,
                handler_length: c[7] as u32,
                class_token_or_filter: read_u32(c, 8),
            });
        }
        Ok(start + data_size)
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_header() {
        // ldarg.0; ldarg.1; add; ret
        let body = [0x12u8, 0x02, 0x03, 0x58, 0x2A];
        let parsed = parse_method_body(&body).unwrap();
        assert_eq!(parsed.max_stack, 8);
        assert_eq!(parsed.code, &[0x02, 0x03, 0x58, 0x2A]);
        assert_eq!(parsed.local_sig_token, 0);
        assert!(parsed.eh_clauses.is_empty());
    }

    #[test]
    fn fat_header_with_locals() {
        let mut body = alloc::vec![0u8; 16];
        body[0] = 0x13; // fat, init locals via flags below
        body[1] = 0x30; // header size 3 words
        body[2] = 0x04; // max stack
        body[4] = 0x04; // code size
        body[8..12].copy_from_slice(&0x1100_0001u32.to_le_bytes());
        body[12..16].copy_from_slice(&[0x02, 0x03, 0x58, 0x2A]);
        body[0] |= 0x10; // init locals
        let parsed = parse_method_body(&body).unwrap();
        assert_eq!(parsed.max_stack, 4);
        assert_eq!(parsed.local_sig_token, 0x1100_0001);
        assert!(parsed.init_locals);
        assert_eq!(parsed.code.len(), 4);
    }

    #[test]
    fn small_eh_section() {
        let mut body = alloc::vec![0u8; 32];
        body[0] = 0x1B; // fat + more sects
        body[1] = 0x30;
        body[2] = 0x08;
        body[4] = 0x02; // code size 2
        body[12] = 0x00; // nop
        body[13] = 0x2A; // ret
        // Section header at offset 16 (aligned past 14).
        body[16] = 0x01; // EH table, small
        body[17] = 16; // data size: header + one clause
        let clause = &mut body[20..32];
        clause[0] = EH_CLAUSE_FINALLY as u8;
        clause[2] = 0; // try offset
        clause[4] = 1; // try length
        clause[5] = 1; // handler offset
        clause[7] = 1; // handler length
        let parsed = parse_method_body(&body).unwrap();
        assert_eq!(parsed.eh_clauses.len(), 1);
        assert_eq!(parsed.eh_clauses[0].kind, EH_CLAUSE_FINALLY);
        assert_eq!(parsed.eh_clauses[0].try_length, 1);
    }

    #[test]
    fn truncated_tiny_body_is_rejected() {
        let body = [0x12u8, 0x02];
        assert_eq!(
            parse_method_body(&body).unwrap_err(),
            JitError::MalformedHeader
        );
    }
}

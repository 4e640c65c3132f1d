//! Patch generation
//!
//! Greedy matcher: every 8-byte window of the old image is indexed by its
//! first occurrence, and at each position of the new image the longer of the
//! hashed candidate and the continuation of the previous copy wins. Unmatched
//! bytes are collected into literal runs.

use std::collections::HashMap;

use super::{CMD_BYTE, CMD_COPY, CMD_END, CMD_LITERAL, LONG_PREFIX_MARK};

/// Shortest match worth a copy command.
pub const MIN_MATCH: usize = 8;

/// Encode `size` as a 4-byte or 9-byte size prefix.
pub fn encode_size_prefix(size: u64) -> Vec<u8> {
    let bytes = size.to_le_bytes();
    let [b0, b1, b2, b3, h0, h1, h2, h3] = bytes;
    if size >> 32 == 0 && b3 != LONG_PREFIX_MARK {
        return vec![b0, b1, b2, b3];
    }
    vec![b0, b1, b2, LONG_PREFIX_MARK, b3, h0, h1, h2, h3]
}

/// Build a patch that turns `old` into `new`.
pub fn create_patch(old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut patch = encode_size_prefix(new.len() as u64);

    let mut index: HashMap<u64, usize> = HashMap::with_capacity(old.len());
    for pos in 0..old.len().saturating_sub(MIN_MATCH - 1) {
        if let Some(key) = window(old, pos) {
            index.entry(key).or_insert(pos);
        }
    }

    let mut literal: Vec<u8> = Vec::new();
    let mut pos = 0usize;
    let mut follow: Option<usize> = None;
    while pos < new.len() {
        let rest = new.get(pos..).unwrap_or_default();
        let continued = follow.map(|old_pos| (old_pos, common_prefix(old.get(old_pos..).unwrap_or_default(), rest)));
        let hashed = window(new, pos)
            .and_then(|key| index.get(&key))
            .map(|&old_pos| (old_pos, common_prefix(old.get(old_pos..).unwrap_or_default(), rest)));
        let best = match (continued, hashed) {
            (Some(c), Some(h)) if h.1 > c.1 => Some(h),
            (Some(c), _) => Some(c),
            (None, h) => h,
        };

        match best {
            Some((old_pos, len)) if len >= MIN_MATCH => {
                push_literal(&mut patch, &literal);
                literal.clear();
                patch.push(CMD_COPY);
                patch.extend_from_slice(&(old_pos as u64).to_le_bytes());
                patch.extend_from_slice(&(len as u64).to_le_bytes());
                pos = pos.saturating_add(len);
                follow = Some(old_pos.saturating_add(len));
            }
            _ => {
                if let Some(&b) = new.get(pos) {
                    literal.push(b);
                }
                pos = pos.saturating_add(1);
                follow = follow.map(|p| p.saturating_add(1));
            }
        }
    }
    push_literal(&mut patch, &literal);
    patch.push(CMD_END);
    patch
}

fn window(data: &[u8], pos: usize) -> Option<u64> {
    let bytes: [u8; MIN_MATCH] = data.get(pos..pos.checked_add(MIN_MATCH)?)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn push_literal(patch: &mut Vec<u8>, literal: &[u8]) {
    match literal {
        [] => {}
        [byte] => patch.extend_from_slice(&[CMD_BYTE, *byte]),
        _ => {
            for run in literal.chunks(u32::MAX as usize) {
                patch.push(CMD_LITERAL);
                patch.extend_from_slice(&(run.len() as u32).to_le_bytes());
                patch.extend_from_slice(run);
            }
        }
    }
}

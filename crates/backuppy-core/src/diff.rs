//! Position-addressed binary diff codec (§4.3).
//!
//! A diff is a concatenation of steps `@<pos>|<action><len>|<payload?>` where
//! `pos` is the absolute offset in the *original* file the step applies at,
//! as if no earlier step had already been applied — the applier tracks a
//! running offset to resolve each one against the stream it is actually
//! producing.

use sha2::{Digest, Sha256};

use crate::error::{BackupError, Result};
use crate::io::{StreamHandle, BLOCK_SIZE};

/// Upper bound on the Myers search depth per aligned block pair. Beyond this
/// the two blocks are similar enough to nothing, or large enough, that an
/// O(D^2) edit-graph search is not worth it; the block is emitted as a
/// single replace step instead of diffed further.
const MAX_D_SEARCH: usize = 4096;

/// Signals that a diff exceeded `discard_diff_percentage` of the original
/// size; the caller should fall back to storing a full copy. Not a
/// `BackupError` variant — this is a normal branch, never user-visible.
pub struct DiffTooLarge;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Delete,
    Insert,
    Replace,
}

impl Action {
    fn letter(&self) -> char {
        match self {
            Action::Delete => 'D',
            Action::Insert => 'I',
            Action::Replace => 'X',
        }
    }

    fn from_letter(c: char) -> Result<Action> {
        match c {
            'D' => Ok(Action::Delete),
            'I' => Ok(Action::Insert),
            'X' => Ok(Action::Replace),
            other => Err(BackupError::DiffParseError(format!("unrecognised action {other:?}"))),
        }
    }
}

struct Step {
    pos: u64,
    action: Action,
    len: usize,
    payload: Vec<u8>,
}

fn encode_step(out: &mut Vec<u8>, step: &Step) {
    out.extend_from_slice(format!("@{}|{}{}|", step.pos, step.action.letter(), step.len).as_bytes());
    if step.action != Action::Delete {
        out.extend_from_slice(&step.payload);
    }
}

/// Compute a diff turning `orig`'s contents into `new`'s contents, reading
/// both block-wise in lock-step (the shorter side yields empty blocks once
/// exhausted). Returns the diff bytes and the hex SHA-256 of `new`, captured
/// as a side effect of draining its reader.
///
/// If `discard_diff_percentage` is given and the running diff size exceeds
/// `p * orig_size`, aborts with `DiffTooLarge` so the caller can fall back to
/// storing a full copy instead.
pub fn compute_diff(
    orig: &StreamHandle,
    new: &StreamHandle,
    discard_diff_percentage: Option<f64>,
) -> Result<std::result::Result<(Vec<u8>, String), DiffTooLarge>> {
    let orig_scope = orig.open()?;
    let new_scope = new.open()?;
    let orig_size = orig_scope.len().unwrap_or(u64::MAX);

    let mut orig_reader = orig_scope.reader(None, true)?;
    let mut new_reader = new_scope.reader(None, true)?;

    let mut out = Vec::new();
    let mut pos: u64 = 0;
    let threshold = discard_diff_percentage.map(|p| (orig_size as f64 * p).ceil() as u64);

    loop {
        let orig_block = next_or_empty(&mut orig_reader)?;
        let new_block = next_or_empty(&mut new_reader)?;
        if orig_block.is_none() && new_block.is_none() {
            break;
        }
        let orig_block = orig_block.unwrap_or_default();
        let new_block = new_block.unwrap_or_default();
        let consumed = orig_block.len() as u64;

        if orig_block.is_empty() && !new_block.is_empty() {
            out.extend_from_slice(
                format!("@{}|I{}|", pos, new_block.len()).as_bytes(),
            );
            out.extend_from_slice(&new_block);
        } else if new_block.is_empty() && !orig_block.is_empty() {
            out.extend_from_slice(format!("@{}|D{}|", pos, orig_block.len()).as_bytes());
        } else if !orig_block.is_empty() || !new_block.is_empty() {
            for step in diff_block(&orig_block, &new_block, pos) {
                encode_step(&mut out, &step);
            }
        }

        pos += consumed;
        if let Some(t) = threshold {
            if out.len() as u64 > t {
                return Ok(Err(DiffTooLarge));
            }
        }
    }

    let new_sha = new_scope.sha();
    Ok(Ok((out, new_sha)))
}

fn next_or_empty(reader: &mut crate::io::Reader<'_>) -> Result<Option<Vec<u8>>> {
    match reader.next() {
        Some(block) => block.map(Some),
        None => Ok(None),
    }
}

/// Diff two same-position blocks using the Myers O(ND) algorithm, translate
/// the Equal/Delete/Insert trace into wire-format steps, and offset every
/// step by `base_pos`.
fn diff_block(orig: &[u8], new: &[u8], base_pos: u64) -> Vec<Step> {
    if orig == new {
        return Vec::new();
    }
    let ops = match myers_trace(orig, new) {
        Some(ops) => ops,
        None => {
            // Search depth exceeded MAX_D_SEARCH; treat the whole block as a
            // single replacement rather than paying for a deeper search.
            return vec![Step {
                pos: base_pos,
                action: Action::Replace,
                len: orig.len(),
                payload: new.to_vec(),
            }];
        }
    };
    merge_ops_into_steps(ops, orig, new, base_pos)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// Classic Myers diff (An O(ND) Difference Algorithm, Eugene Myers 1986),
/// backtracked into a run-length sequence of (op, count) pairs over elements
/// of `orig`/`new`. Returns `None` if the edit distance exceeds
/// `MAX_D_SEARCH`.
///
/// The `k`-diagonal index is offset by the fixed `MAX_D_SEARCH` rather than
/// by `orig.len() + new.len()`: the search never visits a `k` outside
/// `-d..=d` for `d <= MAX_D_SEARCH`, so the trace array's size — and the
/// cost of this function — track the actual edit distance, not the size of
/// the blocks being compared. A one-byte change deep inside two full-size
/// blocks is cheap; only a block pair that truly differs almost everywhere
/// pays for the full search before giving up.
fn myers_trace(orig: &[u8], new: &[u8]) -> Option<Vec<Op>> {
    let n = orig.len() as isize;
    let m = new.len() as isize;
    let max_d = (n + m).max(1).min(MAX_D_SEARCH as isize);

    let offset = MAX_D_SEARCH;
    let mut trace: Vec<Vec<isize>> = Vec::new();
    let mut v = vec![0isize; 2 * MAX_D_SEARCH + 1];

    let mut found_d = None;
    'outer: for d in 0..=max_d {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset as isize) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && orig[x as usize] == new[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                found_d = Some(d);
                break 'outer;
            }
            k += 2;
        }
    }

    let d = found_d?;
    backtrack(&trace, orig, new, d, offset)
}

fn backtrack(trace: &[Vec<isize>], orig: &[u8], new: &[u8], d: isize, offset: usize) -> Option<Vec<Op>> {
    let mut x = orig.len() as isize;
    let mut y = new.len() as isize;
    let mut ops = Vec::new();

    for depth in (0..=d).rev() {
        let v = &trace[depth as usize];
        let k = x - y;
        let idx = (k + offset as isize) as usize;
        let prev_k = if k == -depth || (k != depth && v[idx - 1] < v[idx + 1]) {
            k + 1
        } else {
            k - 1
        };
        let prev_idx = (prev_k + offset as isize) as usize;
        let prev_x = v[prev_idx];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            ops.push(Op::Equal);
            x -= 1;
            y -= 1;
        }
        if depth > 0 {
            if x == prev_x {
                ops.push(Op::Insert);
                y -= 1;
            } else {
                ops.push(Op::Delete);
                x -= 1;
            }
        }
    }
    ops.reverse();
    Some(ops)
}

/// Collapse a run-length `Op` trace into wire-format steps, merging adjacent
/// Delete+Insert runs of a span into a single `Replace`.
fn merge_ops_into_steps(ops: Vec<Op>, orig: &[u8], new: &[u8], base_pos: u64) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut oi = 0usize; // index into orig
    let mut ni = 0usize; // index into new
    let mut i = 0usize;

    while i < ops.len() {
        match ops[i] {
            Op::Equal => {
                oi += 1;
                ni += 1;
                i += 1;
            }
            Op::Delete | Op::Insert => {
                let start_oi = oi;
                let start_ni = ni;
                let mut del = 0usize;
                let mut ins = 0usize;
                while i < ops.len() && ops[i] != Op::Equal {
                    match ops[i] {
                        Op::Delete => {
                            del += 1;
                            oi += 1;
                        }
                        Op::Insert => {
                            ins += 1;
                            ni += 1;
                        }
                        Op::Equal => unreachable!(),
                    }
                    i += 1;
                }
                let pos = base_pos + start_oi as u64;
                if del > 0 && ins > 0 {
                    steps.push(Step {
                        pos,
                        action: Action::Replace,
                        len: del,
                        payload: new[start_ni..start_ni + ins].to_vec(),
                    });
                } else if del > 0 {
                    steps.push(Step { pos, action: Action::Delete, len: del, payload: Vec::new() });
                } else {
                    steps.push(Step {
                        pos,
                        action: Action::Insert,
                        len: ins,
                        payload: new[start_ni..start_ni + ins].to_vec(),
                    });
                }
            }
        }
    }
    let _ = orig;
    steps
}

/// Stream `diff` bytes, reconstructing `new` by copying catch-up bytes from
/// `orig` and interleaving the steps' own actions, writing everything to
/// `out`.
pub fn apply_diff(orig: &StreamHandle, diff: &StreamHandle, out: &StreamHandle) -> Result<()> {
    let orig_scope = orig.open()?;
    let diff_scope = diff.open()?;
    let out_scope = out.open()?;

    let mut diff_bytes = Vec::new();
    diff_scope.reader(None, true)?.try_for_each(|b| -> Result<()> {
        diff_bytes.extend_from_slice(&b?);
        Ok(())
    })?;

    let mut orig_reader = orig_scope.reader(None, true)?;
    let mut orig_buf: Vec<u8> = Vec::new();
    let mut orig_exhausted = false;
    let mut orig_consumed: u64 = 0; // bytes of orig already copied to out
    let mut writer = out_scope.writer();

    let mut cursor = 0usize;
    let mut offset: i64 = 0; // running offset, per §4.3's apply algorithm

    while cursor < diff_bytes.len() {
        if diff_bytes[cursor] != b'@' {
            return Err(BackupError::DiffParseError(format!(
                "expected step header at byte {cursor}"
            )));
        }
        let bar1 = find_byte(&diff_bytes, cursor + 1, b'|')
            .ok_or_else(|| BackupError::DiffParseError("unterminated position field".into()))?;
        let pos: i64 = std::str::from_utf8(&diff_bytes[cursor + 1..bar1])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BackupError::DiffParseError("bad position field".into()))?;

        let action_char = diff_bytes[bar1 + 1] as char;
        let action = Action::from_letter(action_char)?;
        let len_start = bar1 + 2;
        let bar2 = find_byte(&diff_bytes, len_start, b'|')
            .ok_or_else(|| BackupError::DiffParseError("unterminated length field".into()))?;
        let len: usize = std::str::from_utf8(&diff_bytes[len_start..bar2])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BackupError::DiffParseError("bad length field".into()))?;

        let payload_start = bar2 + 1;
        let has_payload = action != Action::Delete;
        let payload_end = if has_payload { payload_start + len } else { payload_start };
        if payload_end > diff_bytes.len() {
            return Err(BackupError::DiffParseError("payload runs past end of diff".into()));
        }
        let payload = &diff_bytes[payload_start..payload_end];

        // Catch the original up to pos - offset.
        let target = (pos - offset).max(0) as u64;
        copy_orig_until(
            &mut orig_reader,
            &mut orig_buf,
            &mut orig_exhausted,
            &mut orig_consumed,
            target,
            &mut writer,
        )?;

        match action {
            Action::Delete => {
                skip_orig(
                    &mut orig_reader,
                    &mut orig_buf,
                    &mut orig_exhausted,
                    &mut orig_consumed,
                    len as u64,
                )?;
                offset -= len as i64;
            }
            Action::Insert => {
                writer.write_block(payload)?;
                offset += len as i64;
            }
            Action::Replace => {
                writer.write_block(payload)?;
                skip_orig(
                    &mut orig_reader,
                    &mut orig_buf,
                    &mut orig_exhausted,
                    &mut orig_consumed,
                    len as u64,
                )?;
            }
        }

        cursor = payload_end;
    }

    // Copy any remaining original bytes.
    copy_orig_until(
        &mut orig_reader,
        &mut orig_buf,
        &mut orig_exhausted,
        &mut orig_consumed,
        u64::MAX,
        &mut writer,
    )?;

    Ok(())
}

fn find_byte(hay: &[u8], from: usize, needle: u8) -> Option<usize> {
    hay[from..].iter().position(|&b| b == needle).map(|i| i + from)
}

fn fill_orig_buf(
    reader: &mut crate::io::Reader<'_>,
    buf: &mut Vec<u8>,
    exhausted: &mut bool,
) -> Result<()> {
    if *exhausted {
        return Ok(());
    }
    match reader.next() {
        Some(block) => buf.extend_from_slice(&block?),
        None => *exhausted = true,
    }
    Ok(())
}

fn copy_orig_until(
    reader: &mut crate::io::Reader<'_>,
    buf: &mut Vec<u8>,
    exhausted: &mut bool,
    consumed: &mut u64,
    target: u64,
    writer: &mut crate::io::Writer<'_>,
) -> Result<()> {
    while *consumed < target {
        if buf.is_empty() {
            fill_orig_buf(reader, buf, exhausted)?;
            if buf.is_empty() && *exhausted {
                break;
            }
        }
        let want = (target - *consumed).min(buf.len() as u64) as usize;
        if want == 0 {
            break;
        }
        let chunk: Vec<u8> = buf.drain(..want).collect();
        writer.write_block(&chunk)?;
        *consumed += want as u64;
    }
    Ok(())
}

fn skip_orig(
    reader: &mut crate::io::Reader<'_>,
    buf: &mut Vec<u8>,
    exhausted: &mut bool,
    consumed: &mut u64,
    len: u64,
) -> Result<()> {
    let mut remaining = len;
    while remaining > 0 {
        if buf.is_empty() {
            fill_orig_buf(reader, buf, exhausted)?;
            if buf.is_empty() && *exhausted {
                break;
            }
        }
        let take = remaining.min(buf.len() as u64) as usize;
        buf.drain(..take);
        remaining -= take as u64;
        *consumed += take as u64;
    }
    Ok(())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

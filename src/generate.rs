//! Component C: revision materialisation (spec §4.3), grounded on
//! `generate.c`'s edit-script interpreter and keyword expander.
//!
//! Blob text for any one revision is produced by walking from the branch
//! head down to the wanted revision, applying each delta's reverse edit
//! script in turn against a [`GapBuffer`] seeded with the head's full text,
//! then (optionally) expanding RCS keywords in the result.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::cvsnumber::CvsNumber;
use crate::diagnostics::FatalError;
use crate::gapbuffer::GapBuffer;
use crate::model::{CvsMaster, ExpandMode};

/// Apply one delta's reverse edit script (`a`/`d` commands, RFC-1179-ish
/// RCS ed-script subset) against `base`, producing the previous revision's
/// text. Mirrors `parse_next_delta_command`'s monotonicity checks: within
/// one script, insertion points must not move backwards, and deletions
/// must not overlap a prior command's range.
pub fn apply_edit_script(base: &[u8], script: &[u8], master: &str) -> Result<Vec<u8>, FatalError> {
    let mut buf = GapBuffer::from_text(base);
    let mut adprev: i64 = 0;
    let mut dafter: i64 = 0;
    let mut pos = 0usize;
    // Every command's line1 references the base text's original numbering;
    // `adjust` tracks how far the buffer has already grown/shrunk from
    // earlier commands so later commands land on the right buffer line.
    let mut adjust: i64 = 0;

    while pos < script.len() {
        let line_end = find_newline(script, pos);
        let cmd_line = std::str::from_utf8(&script[pos..line_end]).map_err(|_| {
            FatalError::MalformedMaster {
                master: master.into(),
                reason: "non-UTF8 edit script command".into(),
            }
        })?;
        pos = (line_end + 1).min(script.len());

        if cmd_line.is_empty() {
            continue;
        }
        let cmd = cmd_line.as_bytes()[0];
        let mut fields = cmd_line[1..].split_whitespace();
        let parse_field = |f: Option<&str>| -> Result<i64, FatalError> {
            f.and_then(|s| s.parse().ok()).ok_or_else(|| FatalError::MalformedMaster {
                master: master.into(),
                reason: "corrupt delta command".into(),
            })
        };
        let line1 = parse_field(fields.next())?;
        let nlines = parse_field(fields.next())?;
        if nlines <= 0 || (cmd != b'a' && cmd != b'd') {
            return Err(FatalError::MalformedMaster {
                master: master.into(),
                reason: "corrupt delta".into(),
            });
        }

        match cmd {
            b'a' => {
                if line1 < adprev {
                    return Err(FatalError::DeltaOrderViolation {
                        master: master.into(),
                        revision: String::new(),
                        reason: "backward insertion in delta".into(),
                    });
                }
                adprev = line1 + 1;
                let mut new_lines = Vec::with_capacity(nlines as usize);
                for _ in 0..nlines {
                    let le = find_newline(script, pos);
                    let end = (le + 1).min(script.len());
                    new_lines.push(script[pos..end].to_vec());
                    pos = end;
                }
                buf.insert_lines((line1 + adjust) as usize, new_lines);
                adjust += nlines;
            }
            b'd' => {
                if line1 < adprev || line1 < dafter {
                    return Err(FatalError::DeltaOrderViolation {
                        master: master.into(),
                        revision: String::new(),
                        reason: "backward deletion in delta".into(),
                    });
                }
                adprev = line1;
                dafter = line1 + nlines;
                buf.delete_lines((line1 + adjust) as usize, nlines as usize);
                adjust -= nlines;
            }
            _ => unreachable!("validated above"),
        }
    }
    Ok(buf.into_bytes())
}

fn find_newline(s: &[u8], from: usize) -> usize {
    s[from..].iter().position(|&b| b == b'\n').map(|i| from + i).unwrap_or(s.len())
}

/// Reconstruct every revision's full text in one master (spec §4.3's
/// "materialise on demand" made eager at analysis time so blobs can be
/// staged once per file rather than re-walked per branch).
///
/// The deltatext stored under a version's own number is always the diff
/// that, applied to the text of the version whose `next` field names it,
/// produces this version's text; the one exception is the master's `head`
/// revision, whose deltatext is full text. Branch roots are reached the
/// same way, via the branchpoint version's `branches` list rather than
/// `next` — both cases reduce to "apply my own patch against my
/// predecessor's text," so one predecessor map covers both.
pub fn materialize_all(master: &CvsMaster, raw: &[u8]) -> Result<HashMap<CvsNumber, Vec<u8>>, FatalError> {
    let mut predecessor: HashMap<CvsNumber, CvsNumber> = HashMap::new();
    for v in &master.versions {
        if let Some(next) = v.next {
            predecessor.entry(next).or_insert(v.number);
        }
        for &branch_root in &v.branches {
            predecessor.entry(branch_root).or_insert(v.number);
        }
    }

    let patches: HashMap<CvsNumber, &crate::model::CvsPatch> =
        master.patches.iter().map(|p| (p.number, p.as_ref())).collect();

    let mut memo: HashMap<CvsNumber, Vec<u8>> = HashMap::new();
    for v in &master.versions {
        materialize_one(v.number, master, raw, &predecessor, &patches, &mut memo)?;
    }

    let mut out = HashMap::with_capacity(memo.len());
    for v in &master.versions {
        let text = memo.remove(&v.number).unwrap_or_default();
        let text = if master.expand.expands_keywords() {
            let log = patches.get(&v.number).map(|p| p.log.as_str()).unwrap_or("");
            let revision = v.number.to_string();
            let date = format_cvs_date(v.date);
            let ctx = KeywordContext {
                filename: master.export_name.as_str(),
                revision: &revision,
                date: &date,
                author: v.author.as_str(),
                state: v.state.as_str(),
                master_name: master.master_name.as_str(),
                log,
            };
            expand_keywords(&text, master.expand, &ctx)
        } else {
            text
        };
        out.insert(v.number, text);
    }
    Ok(out)
}

/// Render a [`CvsTime`] as RCS's `YYYY/MM/DD HH:MM:SS` keyword-value date
/// format (spec §4.3's `$Date$`).
fn format_cvs_date(date: crate::model::CvsTime) -> String {
    match time::OffsetDateTime::from_unix_timestamp(date as i64) {
        Ok(dt) => format!(
            "{:04}/{:02}/{:02} {:02}:{:02}:{:02}",
            dt.year(),
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        ),
        Err(_) => String::new(),
    }
}

fn materialize_one(
    number: CvsNumber,
    master: &CvsMaster,
    raw: &[u8],
    predecessor: &HashMap<CvsNumber, CvsNumber>,
    patches: &HashMap<CvsNumber, &crate::model::CvsPatch>,
    memo: &mut HashMap<CvsNumber, Vec<u8>>,
) -> Result<Vec<u8>, FatalError> {
    if let Some(text) = memo.get(&number) {
        return Ok(text.clone());
    }
    let Some(patch) = patches.get(&number) else {
        return Err(FatalError::MalformedMaster {
            master: master.master_name.as_str().into(),
            reason: format!("no deltatext for revision {number}"),
        });
    };
    let start = patch.text.offset as usize;
    let end = start + patch.text.length as usize;
    let slice = crate::grammar::unescape_span(raw, start, end);

    let text = match predecessor.get(&number) {
        None => slice,
        Some(&pred) => {
            let base = materialize_one(pred, master, raw, predecessor, patches, memo)?;
            apply_edit_script(&base, &slice, master.master_name.as_str())?
        }
    };
    memo.insert(number, text.clone());
    Ok(text)
}

/// Parameters needed to expand keywords in one revision's text, gathered
/// from the owning [`crate::model::CvsCommit`] and master.
pub struct KeywordContext<'a> {
    pub filename: &'a str,
    pub revision: &'a str,
    pub date: &'a str,
    pub author: &'a str,
    pub state: &'a str,
    pub master_name: &'a str,
    pub log: &'a str,
}

fn keyword_value(name: &str, ctx: &KeywordContext) -> Option<String> {
    Some(match name {
        "Author" => ctx.author.to_string(),
        "Date" => ctx.date.to_string(),
        "State" => ctx.state.to_string(),
        "Revision" => ctx.revision.to_string(),
        "RCSfile" => ctx.filename.to_string(),
        "Source" => ctx.master_name.to_string(),
        "Id" => format!("{} {} {} {} {}", ctx.filename, ctx.revision, ctx.date, ctx.author, ctx.state),
        "Header" => {
            format!("{} {} {} {} {}", ctx.master_name, ctx.revision, ctx.date, ctx.author, ctx.state)
        }
        "Name" => String::new(),
        "Locker" => String::new(),
        _ => return None,
    })
}

const KEYWORDS: &[&str] =
    &["Author", "Date", "Header", "Id", "Locker", "Log", "Name", "RCSfile", "Revision", "Source", "State"];

/// Expand `$Keyword$`/`$Keyword: value $` markers per `mode` (spec §4.3).
/// `$Log$` lines are replaced with the log message, one RCS-style line per
/// message line, each prefixed with the comment leader already present
/// before the `$Log$` marker on its own line.
pub fn expand_keywords(text: &[u8], mode: ExpandMode, ctx: &KeywordContext) -> Vec<u8> {
    if !mode.expands_keywords() {
        return text.to_vec();
    }
    let text = String::from_utf8_lossy(text);
    let mut out = String::with_capacity(text.len());
    let mut lines = text.split_inclusive('\n').peekable();
    while let Some(line) = lines.next() {
        out.push_str(&expand_line(line, mode, ctx));
    }
    out.into_bytes()
}

fn expand_line(line: &str, mode: ExpandMode, ctx: &KeywordContext) -> String {
    let mut result = String::with_capacity(line.len());
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            if let Some((name, end)) = match_keyword(&line[i + 1..]) {
                if name == "Log" {
                    let leader: String = line[..i].to_string();
                    writeln!(result, "${}$", name).ok();
                    for log_line in ctx.log.lines() {
                        result.push_str(&leader);
                        result.push_str(log_line);
                        result.push('\n');
                    }
                    i += 1 + end;
                    continue;
                }
                let value = keyword_value(name, ctx);
                match (mode, value) {
                    (ExpandMode::K, _) => {
                        write!(result, "${name}$").ok();
                    }
                    (ExpandMode::Kvl, Some(v)) | (ExpandMode::Kv, Some(v)) => {
                        write!(result, "${name}: {v} $").ok();
                    }
                    (ExpandMode::V, Some(v)) => {
                        write!(result, "{v}").ok();
                    }
                    _ => {
                        write!(result, "${name}$").ok();
                    }
                }
                i += 1 + end;
                continue;
            }
        }
        result.push(bytes[i] as char);
        i += 1;
    }
    result
}

/// Does `s` begin with one of [`KEYWORDS`] followed by `$` or `:`? Returns
/// the keyword name and the byte offset of whatever follows it (`$` or the
/// rest of a `: value $` span) relative to the start of `s`.
fn match_keyword(s: &str) -> Option<(&str, usize)> {
    for &kw in KEYWORDS {
        if let Some(rest) = s.strip_prefix(kw) {
            match rest.chars().next() {
                Some('$') => return Some((kw, kw.len() + 1)),
                Some(':') => {
                    let close = rest.find('$').map(|p| p + 1).unwrap_or(rest.len());
                    return Some((kw, kw.len() + close));
                }
                _ => continue,
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_command_accounts_for_earlier_commands_shifting_the_buffer() {
        let base = b"one\ntwo\nthree\nfour\nfive\n";
        let script = b"d1 1\nd3 1\n";
        let out = apply_edit_script(base, script, "f.c,v").unwrap();
        assert_eq!(out, b"two\nfour\nfive\n");
    }

    #[test]
    fn delete_after_insert_targets_the_original_line_number() {
        let base = b"one\ntwo\nthree\nfour\n";
        let script = b"a1 1\ninserted\nd3 1\n";
        let out = apply_edit_script(base, script, "f.c,v").unwrap();
        assert_eq!(out, b"one\ninserted\ntwo\nfour\n");
    }

    #[test]
    fn backward_insert_is_rejected() {
        let base = b"one\ntwo\n";
        let script = b"a2 1\nx\na1 1\ny\n";
        assert!(apply_edit_script(base, script, "f.c,v").is_err());
    }

    #[test]
    fn kv_mode_expands_revision_keyword() {
        let ctx = KeywordContext {
            filename: "f.c",
            revision: "1.2",
            date: "2024/01/01 00:00:00",
            author: "alice",
            state: "Exp",
            master_name: "f.c,v",
            log: "message",
        };
        let out = expand_keywords(b"id is $Revision$\n", ExpandMode::Kv, &ctx);
        assert_eq!(String::from_utf8(out).unwrap(), "id is $Revision: 1.2 $\n");
    }

    #[test]
    fn materialize_all_reconstructs_every_revision_and_expands_keywords() {
        use crate::atom::AtomTable;
        use crate::model::{master_dir_root, CvsPatch, CvsVersion, TextLocation};
        use std::cell::RefCell;

        let atoms = AtomTable::new();
        let head_text: &[u8] = b"id $Revision$\ntwo\nthree\n";
        let script: &[u8] = b"d2 1\na1 1\ninserted\n";
        let mut raw = Vec::new();
        raw.extend_from_slice(head_text);
        let head_loc = TextLocation { offset: 0, length: head_text.len() as u64 };
        raw.extend_from_slice(script);
        let root_loc = TextLocation { offset: head_text.len() as u64, length: script.len() as u64 };

        let v12 = CvsNumber::parse("1.2").unwrap();
        let v11 = CvsNumber::parse("1.1").unwrap();
        let master = CvsMaster {
            master_name: atoms.intern("f.c,v"),
            export_name: atoms.intern("f.c"),
            dir: master_dir_root(&atoms),
            mode: 0o644,
            versions: vec![
                std::rc::Rc::new(CvsVersion {
                    number: v12,
                    author: atoms.intern("alice"),
                    state: atoms.intern("Exp"),
                    commitid: None,
                    date: 1_000_000,
                    dead: false,
                    next: Some(v11),
                    branches: Vec::new(),
                    node: RefCell::new(None),
                }),
                std::rc::Rc::new(CvsVersion {
                    number: v11,
                    author: atoms.intern("bob"),
                    state: atoms.intern("Exp"),
                    commitid: None,
                    date: 900_000,
                    dead: false,
                    next: None,
                    branches: Vec::new(),
                    node: RefCell::new(None),
                }),
            ],
            patches: vec![
                std::rc::Rc::new(CvsPatch { number: v12, log: atoms.intern("first"), text: head_loc, node: RefCell::new(None) }),
                std::rc::Rc::new(CvsPatch { number: v11, log: atoms.intern("second"), text: root_loc, node: RefCell::new(None) }),
            ],
            head: v12,
            branch: None,
            symbols: Vec::new(),
            expand: ExpandMode::Kv,
            total_revisions: 2,
            skew_vulnerable: 0,
        };

        let texts = materialize_all(&master, &raw).unwrap();
        assert_eq!(
            String::from_utf8(texts[&v12].clone()).unwrap(),
            "id $Revision: 1.2 $\ntwo\nthree\n"
        );
        assert_eq!(
            String::from_utf8(texts[&v11].clone()).unwrap(),
            "id $Revision: 1.1 $\ninserted\nthree\n"
        );
    }

    #[test]
    fn old_mode_leaves_text_untouched() {
        let ctx = KeywordContext {
            filename: "f.c",
            revision: "1.2",
            date: "d",
            author: "a",
            state: "Exp",
            master_name: "f.c,v",
            log: "m",
        };
        let input = b"id is $Revision: 1.1 $\n";
        assert_eq!(expand_keywords(input, ExpandMode::Old, &ctx), input);
    }
}

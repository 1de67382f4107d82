//! Component F (ambient): `,v` master file reader.
//!
//! The original parses RCS masters with a generated lex/yacc grammar; no
//! parser-generator crate appears anywhere in this corpus, so this is a
//! hand-written recursive-descent reader over the tokenised admin/delta/
//! deltatext blocks instead — the same shape `serde`-free config readers
//! take elsewhere in the corpus (manual tokenise-then-build rather than a
//! derive macro, since RCS's `@...@`-quoted strings need bespoke
//! unescaping `serde` has no notion of).

use std::collections::HashMap;
use std::rc::Rc;

use crate::cvsnumber::CvsNumber;
use crate::diagnostics::FatalError;
use crate::model::{CvsMaster, CvsPatch, CvsVersion, ExpandMode, TextLocation};

/// A lexer over an RCS master's bytes. RCS text is whitespace-delimited
/// tokens plus `@...@`-quoted strings (an embedded `@@` is a literal `@`).
struct Lexer<'a> {
    text: &'a [u8],
    pos: usize,
}

enum Token<'a> {
    Word(&'a [u8]),
    /// An `@...@`-quoted string; `start`/`end` bound the text between the
    /// delimiters (doubled `@@` not yet collapsed).
    Quoted { start: usize, end: usize },
    Semi,
    Colon,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a [u8]) -> Self {
        Lexer { text, pos: 0 }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.text.len() && self.text[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn next(&mut self) -> Option<Token<'a>> {
        self.skip_ws();
        if self.pos >= self.text.len() {
            return None;
        }
        match self.text[self.pos] {
            b';' => {
                self.pos += 1;
                Some(Token::Semi)
            }
            b':' => {
                self.pos += 1;
                Some(Token::Colon)
            }
            b'@' => {
                self.pos += 1;
                let start = self.pos;
                loop {
                    match self.text[self.pos..].iter().position(|&b| b == b'@') {
                        Some(rel) => {
                            let at = self.pos + rel;
                            if self.text.get(at + 1) == Some(&b'@') {
                                self.pos = at + 2;
                                continue;
                            }
                            let end = at;
                            self.pos = at + 1;
                            return Some(Token::Quoted { start, end });
                        }
                        None => {
                            self.pos = self.text.len();
                            return Some(Token::Quoted { start, end: self.text.len() });
                        }
                    }
                }
            }
            _ => {
                let start = self.pos;
                while self.pos < self.text.len()
                    && !self.text[self.pos].is_ascii_whitespace()
                    && self.text[self.pos] != b';'
                    && self.text[self.pos] != b':'
                {
                    self.pos += 1;
                }
                Some(Token::Word(&self.text[start..self.pos]))
            }
        }
    }

    fn unescape(&self, start: usize, end: usize) -> Vec<u8> {
        unescape_span(self.text, start, end)
    }
}

/// Collapse `@@` to a literal `@` within `text[start..end]` — an RCS
/// `@...@`-quoted span's raw byte range, as returned by [`TextLocation`]
/// or [`Token::Quoted`]. Used both while parsing (log/value strings) and
/// later when materialising deltatext (spec §4.3).
pub fn unescape_span(text: &[u8], start: usize, end: usize) -> Vec<u8> {
    let raw = &text[start..end];
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        out.push(raw[i]);
        if raw[i] == b'@' && raw.get(i + 1) == Some(&b'@') {
            i += 2;
        } else {
            i += 1;
        }
    }
    out
}

struct RawDelta {
    number: CvsNumber,
    date: u32,
    author: String,
    state: String,
    branches: Vec<CvsNumber>,
    next: Option<CvsNumber>,
    commitid: Option<String>,
}

struct RawDeltatext {
    number: CvsNumber,
    log: String,
    text: TextLocation,
}

/// Parse one `,v` file's bytes into versions and patches (spec §4.3's
/// upstream "RCS master grammar" dependency).
pub fn parse_master(
    master_path: &std::path::Path,
    text: &[u8],
    dir: crate::model::MasterDir,
    atoms: &crate::atom::AtomTable,
    warnings: &crate::diagnostics::Warnings,
) -> Result<(CvsMaster, std::sync::Arc<str>), FatalError> {
    let master_name = master_path.to_string_lossy().to_string();
    let mut lexer = Lexer::new(text);

    let mut head = CvsNumber::ZERO;
    let mut branch = None;
    let mut expand = ExpandMode::Kv;
    let mut symbols: Vec<(String, CvsNumber)> = Vec::new();
    let mut deltas: Vec<RawDelta> = Vec::new();
    let mut deltatexts: Vec<RawDeltatext> = Vec::new();

    loop {
        let word = match next_word(&mut lexer) {
            Some(w) => w,
            None => break,
        };
        match word.as_str() {
            "head" => {
                head = read_number_value(&mut lexer, &master_name)?;
            }
            "branch" => {
                if let Some(n) = read_optional_number(&mut lexer, &master_name)? {
                    branch = Some(n);
                }
            }
            "access" | "locks" => {
                skip_until_semi(&mut lexer);
            }
            "strict" => {
                expect_semi(&mut lexer);
            }
            "comment" => {
                read_quoted_value(&mut lexer);
            }
            "expand" => {
                if let Some(s) = read_quoted_string(&mut lexer) {
                    expand = ExpandMode::from_flag(&s);
                }
                expect_semi(&mut lexer);
            }
            "symbols" => {
                loop {
                    match lexer.next() {
                        Some(Token::Word(w)) => {
                            let pair = String::from_utf8_lossy(w).to_string();
                            if let Some((name, num)) = pair.split_once(':') {
                                if let Ok(n) = CvsNumber::parse(num) {
                                    symbols.push((name.to_string(), n));
                                }
                            }
                        }
                        Some(Token::Semi) | None => break,
                        _ => {}
                    }
                }
            }
            "desc" => {
                read_quoted_value(&mut lexer);
                break;
            }
            _ => {
                // A revision number starting a delta admin block.
                if let Ok(number) = CvsNumber::parse(&word) {
                    deltas.push(parse_delta_admin(&mut lexer, number, &master_name)?);
                } else {
                    skip_until_semi(&mut lexer);
                }
            }
        }
    }

    // Deltatext section: `<num>\nlog\n@...@\ntext\n@...@`
    loop {
        let word = match next_word(&mut lexer) {
            Some(w) => w,
            None => break,
        };
        let Ok(number) = CvsNumber::parse(&word) else { continue };
        expect_word(&mut lexer, "log");
        let log = read_quoted_string(&mut lexer).unwrap_or_default();
        expect_word(&mut lexer, "text");
        let (start, end) = read_quoted_span(&mut lexer);
        deltatexts.push(RawDeltatext { number, log, text: TextLocation { offset: start as u64, length: (end - start) as u64 } });
    }

    let mut versions = Vec::with_capacity(deltas.len());
    for d in deltas {
        if d.number.depth() % 2 == 1 {
            crate::announce!(warnings, "{master_name}: revision with odd depth ({})", d.number);
        }
        versions.push(Rc::new(CvsVersion {
            number: d.number,
            author: atoms.intern(&d.author),
            state: atoms.intern(&d.state),
            commitid: d.commitid.as_deref().map(|s| atoms.intern(s)),
            date: d.date,
            dead: d.state == "dead",
            next: d.next,
            branches: d.branches,
            node: Default::default(),
        }));
    }
    let mut patches = Vec::with_capacity(deltatexts.len());
    for d in deltatexts {
        patches.push(Rc::new(CvsPatch {
            number: d.number,
            log: atoms.intern(&d.log),
            text: d.text,
            node: Default::default(),
        }));
    }
    let total_revisions = versions.len();

    let export_name = master_path
        .file_name()
        .map(|s| {
            let name = s.to_string_lossy().to_string();
            name.strip_suffix(",v").map(str::to_string).unwrap_or(name)
        })
        .unwrap_or_else(|| master_name.clone());
    let symbol_atoms: Vec<(crate::atom::Atom, CvsNumber)> =
        symbols.into_iter().map(|(n, num)| (atoms.intern(&n), num)).collect();

    // The original takes a file's mode from `stat(2)` on the `,v` master
    // itself (`import.c`'s `cvs->mode = buf.st_mode`), since CVS keeps the
    // working file's permission bits in sync with its master's.
    let mode = std::fs::metadata(master_path)
        .map(|m| std::os::unix::fs::PermissionsExt::mode(&m.permissions()))
        .unwrap_or(0o644);

    let master = CvsMaster {
        master_name: atoms.intern(&master_name),
        export_name: atoms.intern(&export_name),
        dir,
        mode,
        versions,
        patches,
        head,
        branch,
        symbols: symbol_atoms,
        expand,
        total_revisions,
        skew_vulnerable: 0,
    };
    Ok((master, master_name.clone().into()))
}

fn parse_delta_admin(
    lexer: &mut Lexer,
    number: CvsNumber,
    master_name: &str,
) -> Result<RawDelta, FatalError> {
    let mut date = 0u32;
    let mut author = String::new();
    let mut state = String::new();
    let mut branches = Vec::new();
    let mut next = None;
    let mut commitid = None;

    loop {
        let word = match next_word(lexer) {
            Some(w) => w,
            None => break,
        };
        match word.as_str() {
            "date" => {
                let parts = read_words_until_semi(lexer);
                date = parse_rcs_date(&parts, master_name)?;
            }
            "author" => {
                author = read_words_until_semi(lexer).join(" ");
            }
            "state" => {
                state = read_words_until_semi(lexer).join(" ");
            }
            "branches" => {
                for w in read_words_until_semi(lexer) {
                    if let Ok(n) = CvsNumber::parse(&w) {
                        branches.push(n);
                    }
                }
            }
            "next" => {
                let parts = read_words_until_semi(lexer);
                if let Some(n) = parts.first() {
                    next = CvsNumber::parse(n).ok();
                }
            }
            "commitid" => {
                commitid = read_words_until_semi(lexer).into_iter().next();
            }
            _ => {
                // Unknown delta field (e.g. vendor-specific `kopt`/`filename`), or
                // we've run into the next revision number / `desc`.
                if CvsNumber::parse(&word).is_ok() || word == "desc" {
                    break;
                }
                skip_until_semi(lexer);
            }
        }
    }

    Ok(RawDelta { number, date, author, state, branches, next, commitid })
}

fn next_word(lexer: &mut Lexer) -> Option<String> {
    loop {
        match lexer.next()? {
            Token::Word(w) => return Some(String::from_utf8_lossy(w).to_string()),
            Token::Semi | Token::Colon => continue,
            Token::Quoted { .. } => continue,
        }
    }
}

fn expect_word(lexer: &mut Lexer, expected: &str) {
    let _ = next_word(lexer).filter(|w| w == expected);
}

fn expect_semi(lexer: &mut Lexer) {
    loop {
        match lexer.next() {
            Some(Token::Semi) | None => break,
            _ => continue,
        }
    }
}

fn skip_until_semi(lexer: &mut Lexer) {
    loop {
        match lexer.next() {
            Some(Token::Semi) | None => break,
            _ => continue,
        }
    }
}

fn read_words_until_semi(lexer: &mut Lexer) -> Vec<String> {
    let mut words = Vec::new();
    loop {
        match lexer.next() {
            Some(Token::Word(w)) => words.push(String::from_utf8_lossy(w).to_string()),
            Some(Token::Semi) | None => break,
            _ => continue,
        }
    }
    words
}

fn read_number_value(lexer: &mut Lexer, master_name: &str) -> Result<CvsNumber, FatalError> {
    let words = read_words_until_semi(lexer);
    let raw = words.first().cloned().unwrap_or_default();
    CvsNumber::parse(&raw)
        .map_err(|_| FatalError::MalformedMaster { master: master_name.into(), reason: format!("bad revision number {raw:?}") })
}

fn read_optional_number(lexer: &mut Lexer, _master_name: &str) -> Result<Option<CvsNumber>, FatalError> {
    let words = read_words_until_semi(lexer);
    Ok(words.first().and_then(|w| CvsNumber::parse(w).ok()))
}

fn read_quoted_string(lexer: &mut Lexer) -> Option<String> {
    loop {
        match lexer.next()? {
            Token::Quoted { start, end } => return Some(String::from_utf8_lossy(&lexer.unescape(start, end)).to_string()),
            Token::Semi | Token::Colon => continue,
            Token::Word(_) => continue,
        }
    }
}

fn read_quoted_value(lexer: &mut Lexer) {
    read_quoted_string(lexer);
}

fn read_quoted_span(lexer: &mut Lexer) -> (usize, usize) {
    loop {
        match lexer.next() {
            Some(Token::Quoted { start, end }) => return (start, end),
            Some(_) => continue,
            None => return (0, 0),
        }
    }
}

/// RCS dates are `YY.MM.DD.hh.mm.ss` (or `YYYY.MM.DD...` post-Y2K),
/// Y2K-disambiguated per RCS convention (`YY < 69` means `20YY`, else
/// `19YY`), converted to seconds since the Unix epoch.
fn parse_rcs_date(parts: &[String], master_name: &str) -> Result<u32, FatalError> {
    let raw = parts.first().cloned().unwrap_or_default();
    let fields: Vec<&str> = raw.split('.').collect();
    if fields.len() != 6 {
        return Err(FatalError::MalformedMaster {
            master: master_name.into(),
            reason: format!("malformed date {raw:?}"),
        });
    }
    let mut year: i32 = fields[0].parse().unwrap_or(0);
    if year < 100 {
        year += if year < 69 { 2000 } else { 1900 };
    }
    let (month, day, hour, min, sec): (u32, u32, u32, u32, u32) = (
        fields[1].parse().unwrap_or(1),
        fields[2].parse().unwrap_or(1),
        fields[3].parse().unwrap_or(0),
        fields[4].parse().unwrap_or(0),
        fields[5].parse().unwrap_or(0),
    );
    let days_from_epoch = days_since_epoch(year, month, day);
    let secs = days_from_epoch as i64 * 86400 + hour as i64 * 3600 + min as i64 * 60 + sec as i64;
    Ok(secs.max(0) as u32)
}

fn is_leap(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_since_epoch(year: i32, month: u32, day: u32) -> i64 {
    let month_days = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut days: i64 = 0;
    if year >= 1970 {
        for y in 1970..year {
            days += if is_leap(y) { 366 } else { 365 };
        }
    } else {
        for y in year..1970 {
            days -= if is_leap(y) { 366 } else { 365 };
        }
    }
    for m in 0..(month as usize).saturating_sub(1) {
        days += month_days[m];
        if m == 1 && is_leap(year) {
            days += 1;
        }
    }
    days + (day as i64 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_trunk_master() {
        let text = br#"head	1.2;
access;
symbols
	RELEASE_1_0:1.1;
locks; strict;
comment	@# @;


1.2
date	2024.01.02.03.04.05;	author alice;	state Exp;
branches;
next	1.1;

1.1
date	2024.01.01.00.00.00;	author alice;	state Exp;
branches;
next	;


desc
@initial import@


1.2
log
@second revision@
text
@line one
line two
@


1.1
log
@first revision@
text
@line one
@
"#;
        let atoms = crate::atom::AtomTable::new();
        let warnings = crate::diagnostics::Warnings::new();
        let (master, _) =
            parse_master(
                std::path::Path::new("f.c,v"),
                text,
                crate::model::master_dir_root(&atoms),
                &atoms,
                &warnings,
            )
            .unwrap();
        assert_eq!(master.versions.len(), 2);
        assert_eq!(master.patches.len(), 2);
        assert_eq!(master.head, CvsNumber::parse("1.2").unwrap());
        assert_eq!(master.symbols.len(), 1);
    }

    #[test]
    fn doubled_at_sign_unescapes_to_one() {
        let text = br#"head	1.1;
access;
symbols;
locks; strict;
comment	@# @;

1.1
date	2024.01.01.00.00.00;	author alice;	state Exp;
branches;
next	;

desc
@@

1.1
log
@log message@
text
@line with an @@ sign
@
"#;
        let atoms = crate::atom::AtomTable::new();
        let warnings = crate::diagnostics::Warnings::new();
        let (master, _) = parse_master(
            std::path::Path::new("f.c,v"),
            text,
            crate::model::master_dir_root(&atoms),
            &atoms,
            &warnings,
        )
        .unwrap();
        let patch = &master.patches[0];
        let bytes = unescape_span(text, patch.text.offset as usize, (patch.text.offset + patch.text.length) as usize);
        assert_eq!(bytes, b"line with an @ sign\n");
    }
}

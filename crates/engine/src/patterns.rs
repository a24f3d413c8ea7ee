//! Worst-case work estimates for Lua string patterns.
//!
//! `string.find`, `match`, `gmatch` and `gsub` run the pattern matcher in C,
//! where the instruction hook never fires. A backtracking pattern over a large
//! subject can keep a worker busy long after its deadline. The sandbox wraps
//! those functions and refuses a call whose estimate exceeds the configured
//! pattern work limit before the matcher starts.
//!
//! The estimate follows the matcher's structure. A start position that gets
//! past the pattern's fixed prefix may try every combination of expansions of
//! the quantified items that have something after them. One expansion can
//! only cover the longest run of subject bytes its class accepts, so
//! `^%s*(.-)%s*$` over ordinary text stays close to linear while `.-.-.-b`
//! over the same text is refused.

/// Character class of a single-byte pattern item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Class {
    /// `.`
    Any,
    Literal(u8),
    /// `%a`, `%d`, ...; uppercase letters negate, other bytes are escapes.
    Named(u8),
    /// `[...]` body without the brackets and the leading `^`.
    Set { negated: bool, body: Vec<u8> },
}

impl Class {
    pub fn matches(&self, c: u8) -> bool {
        match self {
            Class::Any => true,
            Class::Literal(l) => *l == c,
            Class::Named(cl) => named_class_matches(*cl, c),
            Class::Set { negated, body } => set_matches(body, *negated, c),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    One,
    /// `?`
    Optional,
    /// `*`
    Greedy,
    /// `+`
    AtLeastOne,
    /// `-`
    Lazy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Single(Class, Quantifier),
    /// `%bxy`, with its opening byte.
    Balance(Option<u8>),
    /// `%f[set]`
    Frontier,
    /// `%1` to `%9`
    BackReference,
    /// `$` at the very end.
    EndAnchor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub anchored: bool,
    pub items: Vec<Item>,
}

/// The matcher entry points that get wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOp {
    Find,
    Match,
    GMatch,
    GSub,
}

impl PatternOp {
    pub const ALL: [PatternOp; 4] = [PatternOp::Find, PatternOp::Match, PatternOp::GMatch, PatternOp::GSub];

    pub fn name(self) -> &'static str {
        match self {
            PatternOp::Find => "find",
            PatternOp::Match => "match",
            PatternOp::GMatch => "gmatch",
            PatternOp::GSub => "gsub",
        }
    }

    /// `gmatch` treats a leading `^` as a plain byte.
    fn honors_anchor(self) -> bool {
        self != PatternOp::GMatch
    }
}

/// Split a pattern into items. Malformed patterns parse to something
/// reasonable; the matcher itself reports them when it runs.
pub fn parse(pattern: &[u8], honor_anchor: bool) -> Pattern {
    let anchored = honor_anchor && pattern.first() == Some(&b'^');
    let mut i = usize::from(anchored);
    let mut items = Vec::new();

    while i < pattern.len() {
        let next = pattern.get(i + 1).copied();
        match (pattern[i], next) {
            (b'(' | b')', _) => i += 1,
            (b'$', None) => {
                items.push(Item::EndAnchor);
                i += 1;
            }
            (b'%', Some(b'b')) => {
                items.push(Item::Balance(pattern.get(i + 2).copied()));
                i += 4;
            }
            (b'%', Some(b'f')) => {
                i += 2;
                if pattern.get(i) == Some(&b'[') {
                    i = parse_set(pattern, i).0;
                }
                items.push(Item::Frontier);
            }
            (b'%', Some(d)) if d.is_ascii_digit() => {
                items.push(Item::BackReference);
                i += 2;
            }
            _ => {
                let (class, end) = parse_class(pattern, i);
                let quantifier = match pattern.get(end) {
                    Some(b'?') => Quantifier::Optional,
                    Some(b'*') => Quantifier::Greedy,
                    Some(b'+') => Quantifier::AtLeastOne,
                    Some(b'-') => Quantifier::Lazy,
                    _ => Quantifier::One,
                };
                i = if quantifier == Quantifier::One { end } else { end + 1 };
                items.push(Item::Single(class, quantifier));
            }
        }
    }

    Pattern { anchored, items }
}

fn parse_class(pattern: &[u8], i: usize) -> (Class, usize) {
    match pattern[i] {
        b'.' => (Class::Any, i + 1),
        b'%' => match pattern.get(i + 1) {
            Some(&c) => (Class::Named(c), i + 2),
            None => (Class::Literal(b'%'), i + 1),
        },
        b'[' => {
            let (end, negated, body) = parse_set(pattern, i);
            (Class::Set { negated, body }, end)
        }
        c => (Class::Literal(c), i + 1),
    }
}

/// Parse `[...]` starting at `open`. Returns the index past `]`.
///
/// The first byte of the body is taken literally, so `[]]` is a set holding `]`.
fn parse_set(pattern: &[u8], open: usize) -> (usize, bool, Vec<u8>) {
    let mut i = open + 1;
    let negated = pattern.get(i) == Some(&b'^');
    if negated {
        i += 1;
    }
    let start = i;
    loop {
        let Some(&c) = pattern.get(i) else {
            return (pattern.len(), negated, pattern[start.min(pattern.len())..].to_vec());
        };
        i += 1;
        if c == b'%' {
            i += 1;
        }
        match pattern.get(i) {
            Some(b']') => return (i + 1, negated, pattern[start..i].to_vec()),
            Some(_) => {}
            None => return (pattern.len(), negated, pattern[start.min(pattern.len())..].to_vec()),
        }
    }
}

fn named_class_matches(cl: u8, c: u8) -> bool {
    let hit = match cl.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'c' => c.is_ascii_control(),
        b'd' => c.is_ascii_digit(),
        b'g' => c.is_ascii_graphic(),
        b'l' => c.is_ascii_lowercase(),
        b'p' => c.is_ascii_punctuation(),
        b's' => matches!(c, b' ' | b'\t'..=b'\r'),
        b'u' => c.is_ascii_uppercase(),
        b'w' => c.is_ascii_alphanumeric(),
        b'x' => c.is_ascii_hexdigit(),
        _ => return cl == c,
    };
    if cl.is_ascii_uppercase() {
        !hit
    } else {
        hit
    }
}

fn set_matches(body: &[u8], negated: bool, c: u8) -> bool {
    let mut i = 0;
    let mut found = false;
    while i < body.len() {
        if body[i] == b'%' && i + 1 < body.len() {
            found |= named_class_matches(body[i + 1], c);
            i += 2;
        } else if i + 2 < body.len() && body[i + 1] == b'-' {
            found |= body[i] <= c && c <= body[i + 2];
            i += 3;
        } else {
            found |= body[i] == c;
            i += 1;
        }
    }
    found != negated
}

/// Longest run of consecutive subject bytes accepted by `class`.
fn longest_run(subject: &[u8], class: &Class) -> u64 {
    let mut best = 0u64;
    let mut run = 0u64;
    for &c in subject {
        if class.matches(c) {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}

/// Whether the fixed-width prefix matches at `pos`.
fn prefix_matches_at(subject: &[u8], prefix: &[Item], pos: usize) -> bool {
    prefix.iter().enumerate().all(|(offset, item)| match item {
        Item::Single(class, _) => subject.get(pos + offset).is_some_and(|&c| class.matches(c)),
        _ => true,
    })
}

/// Whether the first item after the prefix can possibly match at `pos`.
fn may_begin_at(subject: &[u8], item: Option<&Item>, pos: usize) -> bool {
    match item {
        Some(Item::Single(class, Quantifier::AtLeastOne)) => {
            subject.get(pos).is_some_and(|&c| class.matches(c))
        }
        Some(Item::Balance(Some(open))) => subject.get(pos) == Some(open),
        _ => true,
    }
}

/// Upper bound on matcher steps for one call over the whole subject.
pub fn estimate(subject: &[u8], pattern: &Pattern) -> u64 {
    let n = subject.len() as u64;
    let last_start = if pattern.anchored { 0 } else { subject.len() };
    let starts = 0..=last_start;

    let prefix_len = pattern
        .items
        .iter()
        .take_while(|item| matches!(item, Item::Single(_, Quantifier::One)))
        .count();
    let (prefix, rest) = pattern.items.split_at(prefix_len);

    let scan = (last_start as u64 + 1).saturating_mul(prefix_len.max(1) as u64);
    if rest.is_empty() {
        return scan.saturating_add(n);
    }

    let entries = starts
        .filter(|&pos| prefix_matches_at(subject, prefix, pos) && may_begin_at(subject, rest.first(), pos + prefix_len))
        .count() as u64;

    let mut branches = 1u64;
    let mut work = 0u64;
    for (index, item) in rest.iter().enumerate() {
        let followed = index + 1 < rest.len();
        let (branch, cost) = match item {
            Item::Single(_, Quantifier::One) => (1, 1),
            Item::Single(_, Quantifier::Optional) => (if followed { 2 } else { 1 }, 1),
            // Nothing after it can fail, so it expands once and succeeds
            Item::Single(_, _) if !followed => (1, 1),
            Item::Single(class, _) => (longest_run(subject, class).saturating_add(1), 1),
            Item::Balance(_) | Item::BackReference => (1, n.saturating_add(1)),
            Item::Frontier | Item::EndAnchor => (1, 1),
        };
        branches = branches.saturating_mul(branch);
        work = work.saturating_add(cost);
        if branches == u64::MAX {
            break;
        }
    }

    scan.saturating_add(entries.saturating_mul(branches).saturating_mul(work))
        .saturating_add(n)
}

/// Estimate for one call of `op`. A plain `find` is a substring search.
pub fn estimate_call(op: PatternOp, subject: &[u8], pattern: &[u8], plain: bool) -> u64 {
    if plain && op == PatternOp::Find {
        let n = subject.len() as u64 + 1;
        return n.saturating_mul(pattern.len().max(1) as u64);
    }
    estimate(subject, &parse(pattern, op.honors_anchor()))
}

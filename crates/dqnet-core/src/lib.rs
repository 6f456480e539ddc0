//! Core data model for dqnet.
//!
//! An [`Atom`] is a predicate application: a name plus an ordered list of
//! arguments, each either a constant or a variable (arguments starting with
//! `?`). A [`Rule`] pairs a head atom with an ordered body of subgoals, one of
//! which may be the `@` composition pseudo-subgoal.
//!
//! Everything in this crate is pure: parsing returns a [`ParseError`] for
//! malformed text and unification reports [`Unification::NoMatch`] instead of
//! failing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Prefix marking an argument as a variable.
pub const VARIABLE_PREFIX: char = '?';

/// Name of the reserved composition pseudo-subgoal.
pub const COMPOSE_MARKER: &str = "@";

const IMPLIES: &str = "<-";
const COMPOSE_OPEN: &str = "{";
const COMPOSE_CLOSE: &str = "}";
const COMPOSE_SEPARATOR: &str = " | ";

/// Variable name to value.
pub type Bindings = BTreeMap<String, String>;

pub type Result<T> = std::result::Result<T, ParseError>;

/// Errors raised while parsing atom or rule text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty atom text")]
    Empty,
    #[error("missing predicate name in `{0}`")]
    MissingName(String),
    #[error("unbalanced parentheses or quotes in `{0}`")]
    Unbalanced(String),
    #[error("unexpected text after `)` in `{0}`")]
    TrailingInput(String),
    #[error("empty argument in `{0}`")]
    EmptyArgument(String),
    #[error("rule `{0}` has no `<-` separator")]
    MissingImplication(String),
    #[error("rule `{0}` has an empty body")]
    EmptyBody(String),
}

/// Returns true when `arg` is a variable rather than a constant.
pub fn is_variable(arg: &str) -> bool {
    arg.starts_with(VARIABLE_PREFIX)
}

/// A predicate application.
///
/// Equality and hashing are structural (name plus argument sequence), so an
/// `Atom` can key the pending-request table directly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Atom {
    name: String,
    args: Vec<String>,
}

impl Atom {
    pub fn new<N, I, A>(name: N, args: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses `name(arg, ...)`, optionally terminated by `.`.
    ///
    /// Arguments are split on top-level commas and stripped of surrounding
    /// whitespace and quotes. An atom without parentheses has no arguments.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed).trim_end();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        let Some(open) = trimmed.find('(') else {
            if trimmed.contains(')') {
                return Err(ParseError::Unbalanced(text.to_string()));
            }
            return Ok(Self::new(trimmed, Vec::<String>::new()));
        };

        let name = trimmed[..open].trim();
        if name.is_empty() {
            return Err(ParseError::MissingName(text.to_string()));
        }
        let rest = &trimmed[open + 1..];
        let close = rest
            .rfind(')')
            .ok_or_else(|| ParseError::Unbalanced(text.to_string()))?;
        if !rest[close + 1..].trim().is_empty() {
            return Err(ParseError::TrailingInput(text.to_string()));
        }

        let inner = &rest[..close];
        if inner.trim().is_empty() {
            return Ok(Self::new(name, Vec::<String>::new()));
        }
        let args = split_top_level(inner)
            .ok_or_else(|| ParseError::Unbalanced(text.to_string()))?
            .into_iter()
            .map(|piece| {
                let piece = piece.trim();
                if piece.is_empty() {
                    Err(ParseError::EmptyArgument(text.to_string()))
                } else {
                    Ok(unquote(piece).to_string())
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(name, args))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Predicate signature `name/arity`, the key used for FIB and rule lookup.
    pub fn key(&self) -> String {
        format!("{}/{}", self.name, self.args.len())
    }

    /// Canonical textual form: `name("a", "b")`.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    pub fn is_composition(&self) -> bool {
        self.name == COMPOSE_MARKER
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .map(String::as_str)
            .filter(|arg| is_variable(arg))
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "\"{arg}\"")?;
        }
        f.write_str(")")
    }
}

impl FromStr for Atom {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Head pattern plus ordered body of subgoals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    head: Atom,
    body: Vec<Atom>,
}

impl Rule {
    pub fn new(head: Atom, body: Vec<Atom>) -> Self {
        Self { head, body }
    }

    /// Parses `head <- sub1, sub2, @(?Out, ?A, ?B).`
    ///
    /// Body items are split on commas outside parentheses so multi-argument
    /// subgoals stay intact.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let (head, body) = trimmed
            .split_once(IMPLIES)
            .ok_or_else(|| ParseError::MissingImplication(text.to_string()))?;
        let head = Atom::parse(head)?;

        let body = body.trim();
        let body = body.strip_suffix('.').unwrap_or(body).trim();
        if body.is_empty() {
            return Err(ParseError::EmptyBody(text.to_string()));
        }
        let body = split_top_level(body)
            .ok_or_else(|| ParseError::Unbalanced(text.to_string()))?
            .into_iter()
            .map(Atom::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { head, body })
    }

    pub fn head(&self) -> &Atom {
        &self.head
    }

    pub fn body(&self) -> &[Atom] {
        &self.body
    }

    /// Body items that are real subgoals (everything except composition).
    pub fn subgoals(&self) -> impl Iterator<Item = &Atom> {
        self.body.iter().filter(|atom| !atom.is_composition())
    }

    /// The composition pseudo-subgoal, if the body has one.
    pub fn composition(&self) -> Option<&Atom> {
        self.body.iter().find(|atom| atom.is_composition())
    }

    pub fn unify(&self, query: &Atom) -> Unification {
        unify(&self.head, query)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- ", self.head)?;
        for (i, atom) in self.body.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{atom}")?;
        }
        f.write_str(".")
    }
}

impl FromStr for Rule {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Outcome of matching a query against a pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unification {
    Matched(Bindings),
    NoMatch,
}

impl Unification {
    pub fn is_match(&self) -> bool {
        matches!(self, Unification::Matched(_))
    }

    pub fn into_bindings(self) -> Option<Bindings> {
        match self {
            Unification::Matched(bindings) => Some(bindings),
            Unification::NoMatch => None,
        }
    }
}

/// Unifies a rule head with a query.
///
/// Matches iff name and arity agree and every constant in `head` equals the
/// query argument at the same position. Each head variable is bound to the
/// query's argument at its position (head variable <- query value). A failed
/// match returns no partial bindings.
pub fn unify(head: &Atom, query: &Atom) -> Unification {
    if head.name != query.name || head.args.len() != query.args.len() {
        return Unification::NoMatch;
    }
    let mut bindings = Bindings::new();
    for (h, q) in head.args.iter().zip(&query.args) {
        if is_variable(h) {
            bindings.insert(h.clone(), q.clone());
        } else if h != q {
            return Unification::NoMatch;
        }
    }
    Unification::Matched(bindings)
}

/// Matches a query against a ground fact, binding query variables to the
/// fact's values. A variable repeated in the query must bind consistently.
pub fn match_fact(query: &Atom, fact: &Atom) -> Unification {
    if query.name != fact.name || query.args.len() != fact.args.len() {
        return Unification::NoMatch;
    }
    let mut bindings = Bindings::new();
    for (q, value) in query.args.iter().zip(&fact.args) {
        if is_variable(q) {
            match bindings.get(q) {
                Some(prev) if prev != value => return Unification::NoMatch,
                Some(_) => {}
                None => {
                    bindings.insert(q.clone(), value.clone());
                }
            }
        } else if q != value {
            return Unification::NoMatch;
        }
    }
    Unification::Matched(bindings)
}

/// Applies a composition pattern `@(?Out, ?A, ?B, ...)` to `bindings`.
///
/// `?Out` receives `{a | b | ...}` built from the bound values of the
/// referenced variables in pattern order; the referenced variables are then
/// removed. Unbound references are skipped.
pub fn compose(pattern: &Atom, bindings: &mut Bindings) {
    let Some((target, sources)) = pattern.args.split_first() else {
        return;
    };
    let values: Vec<&str> = sources
        .iter()
        .filter_map(|var| bindings.get(var).map(String::as_str))
        .collect();
    let composed = format!(
        "{COMPOSE_OPEN}{}{COMPOSE_CLOSE}",
        values.join(COMPOSE_SEPARATOR)
    );
    for var in sources {
        bindings.remove(var);
    }
    bindings.insert(target.clone(), composed);
}

/// Re-expresses `bindings`, named after a rule's head variables, in the
/// caller's variable names using the head unification map.
///
/// Head variables that were unified with a constant have nothing to surface.
pub fn translate(head_map: &Bindings, bindings: &Bindings) -> Bindings {
    head_map
        .iter()
        .filter(|(_, caller)| is_variable(caller))
        .filter_map(|(head_var, caller)| {
            bindings
                .get(head_var)
                .map(|value| (caller.clone(), value.clone()))
        })
        .collect()
}

/// Splits on commas that sit outside parentheses and quotes.
/// Returns `None` when parentheses or quotes are unbalanced.
fn split_top_level(text: &str) -> Option<Vec<&str>> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.checked_sub(1)?,
            (None, ',') if depth == 0 => {
                pieces.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || quote.is_some() {
        return None;
    }
    pieces.push(&text[start..]);
    Some(pieces)
}

fn unquote(arg: &str) -> &str {
    for q in ['"', '\''] {
        if arg.len() >= 2 && arg.starts_with(q) && arg.ends_with(q) {
            return &arg[1..arg.len() - 1];
        }
    }
    arg
}

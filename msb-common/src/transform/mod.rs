//! Play-transform engine
//!
//! User-definable mutation of plays at three hook points: `preCompare`
//! (before discovery/queue dedup), `compare` (visible only to the
//! comparator), and `postCompare` (just before the scrobble call). Raw
//! config shapes live in [`dsl`]; they are compiled once into this module's
//! rule tree so the worker loops never interpret config.

pub mod dsl;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};
use crate::play::Play;
use dsl::{HookConfig, LogConfig, OneOrMany, PlayTransformConfig, RuleConfig, WhenClauseConfig};

/// Hook points a transform can run at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PreCompare,
    /// Applied to the candidate play, comparator-only
    CompareCandidate,
    /// Applied to an existing (ring/upstream) play, comparator-only
    CompareExisting,
    PostCompare,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::PreCompare => "preCompare",
            Stage::CompareCandidate => "compare.candidate",
            Stage::CompareExisting => "compare.existing",
            Stage::PostCompare => "postCompare",
        };
        write!(f, "{}", s)
    }
}

/// How much the engine logs per application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    #[default]
    Off,
    /// One before/after diff per invocation
    Diff,
    /// One diff per hook in an array
    All,
}

/// A matcher string is a regular expression iff it begins with `/` and has a
/// closing `/` optionally followed by flag letters; otherwise it is a
/// literal substring. `"/foo"` with no closing slash is a literal.
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(String),
    Pattern(Regex),
}

/// Flags recognized after the closing slash. `g` and `u` are accepted and
/// ignored (replacement is always global, input is always unicode).
static KNOWN_FLAGS: Lazy<Vec<char>> = Lazy::new(|| vec!['i', 'm', 's', 'x', 'g', 'u']);

impl Matcher {
    /// Recognize and compile a matcher string.
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(rest) = raw.strip_prefix('/') {
            if let Some(idx) = rest.rfind('/') {
                let (pattern, flags) = rest.split_at(idx);
                let flags = &flags[1..];
                if flags.chars().all(|c| KNOWN_FLAGS.contains(&c)) {
                    let mut builder = RegexBuilder::new(pattern);
                    builder
                        .case_insensitive(flags.contains('i'))
                        .multi_line(flags.contains('m'))
                        .dot_matches_new_line(flags.contains('s'))
                        .ignore_whitespace(flags.contains('x'));
                    let regex = builder.build().map_err(|e| {
                        Error::Config(format!("invalid transform pattern {:?}: {}", raw, e))
                    })?;
                    return Ok(Matcher::Pattern(regex));
                }
            }
        }
        Ok(Matcher::Literal(raw.to_string()))
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Literal(s) => text.contains(s.as_str()),
            Matcher::Pattern(re) => re.is_match(text),
        }
    }

    /// Replace every occurrence. Regex replacements support `$1` and
    /// `$<name>` capture back-references.
    pub fn replace_all(&self, text: &str, replacement: &str) -> String {
        match self {
            Matcher::Literal(s) => text.replace(s.as_str(), replacement),
            Matcher::Pattern(re) => re.replace_all(text, replacement).into_owned(),
        }
    }
}

/// Guard on one play: all present fields must match.
#[derive(Debug, Clone, Default)]
pub struct WhenClause {
    artist: Option<Matcher>,
    album: Option<Matcher>,
    title: Option<Matcher>,
}

impl WhenClause {
    fn compile(cfg: &WhenClauseConfig) -> Result<Self> {
        Ok(Self {
            artist: cfg.artist.as_deref().map(Matcher::parse).transpose()?,
            album: cfg.album.as_deref().map(Matcher::parse).transpose()?,
            title: cfg.title.as_deref().map(Matcher::parse).transpose()?,
        })
    }

    /// AND across present fields. The artist matcher matches if any of the
    /// play's artists does; an album matcher never matches a play with no
    /// album.
    pub fn matches(&self, play: &Play) -> bool {
        if let Some(m) = &self.artist {
            if !play.data.artists.iter().any(|a| m.is_match(a)) {
                return false;
            }
        }
        if let Some(m) = &self.album {
            match &play.data.album {
                Some(album) if m.is_match(album) => {}
                _ => return false,
            }
        }
        if let Some(m) = &self.title {
            if !m.is_match(&play.data.track) {
                return false;
            }
        }
        true
    }
}

/// OR across clauses; an empty list always matches.
fn any_clause_matches(clauses: &[WhenClause], play: &Play) -> bool {
    clauses.is_empty() || clauses.iter().any(|c| c.matches(play))
}

/// One compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    search: Matcher,
    replace: String,
    when: Vec<WhenClause>,
}

impl Rule {
    fn compile(cfg: &RuleConfig) -> Result<Self> {
        match cfg {
            RuleConfig::Remove(s) => Ok(Self {
                search: Matcher::parse(s)?,
                replace: String::new(),
                when: Vec::new(),
            }),
            RuleConfig::Replace {
                search,
                replace,
                when,
            } => Ok(Self {
                search: Matcher::parse(search)?,
                replace: replace.clone(),
                when: compile_clauses(when.as_deref())?,
            }),
        }
    }

    fn apply(&self, text: &str, play: &Play) -> String {
        if !any_clause_matches(&self.when, play) {
            return text.to_string();
        }
        self.search.replace_all(text, &self.replace).trim().to_string()
    }
}

fn compile_clauses(cfgs: Option<&[WhenClauseConfig]>) -> Result<Vec<WhenClause>> {
    cfgs.unwrap_or_default()
        .iter()
        .map(WhenClause::compile)
        .collect()
}

/// One compiled hook.
#[derive(Debug, Clone, Default)]
pub struct Hook {
    when: Vec<WhenClause>,
    title: Vec<Rule>,
    artists: Vec<Rule>,
    album: Vec<Rule>,
}

impl Hook {
    fn compile(cfg: &HookConfig) -> Result<Self> {
        let compile_rules = |rules: Option<&Vec<RuleConfig>>| -> Result<Vec<Rule>> {
            rules
                .map(|rs| rs.iter().map(Rule::compile).collect())
                .unwrap_or_else(|| Ok(Vec::new()))
        };
        Ok(Self {
            when: compile_clauses(cfg.when.as_deref())?,
            title: compile_rules(cfg.title.as_ref())?,
            artists: compile_rules(cfg.artists.as_ref())?,
            album: compile_rules(cfg.album.as_ref())?,
        })
    }

    /// Apply this hook to a play in place.
    fn apply(&self, play: &mut Play) {
        if !any_clause_matches(&self.when, play) {
            return;
        }

        for rule in &self.title {
            let next = rule.apply(&play.data.track, play);
            play.data.track = next;
        }

        if !self.artists.is_empty() {
            // Artist rules run against each artist independently; emptied
            // artists are removed here, the all-empty drop happens at the
            // stage level.
            let snapshot = play.clone();
            let artists = play
                .data
                .artists
                .iter()
                .map(|artist| {
                    self.artists
                        .iter()
                        .fold(artist.clone(), |acc, rule| rule.apply(&acc, &snapshot))
                })
                .filter(|a| !a.is_empty())
                .collect();
            play.data.artists = artists;
        }

        if let Some(album) = play.data.album.clone() {
            let mut album = album;
            for rule in &self.album {
                album = rule.apply(&album, play);
            }
            play.data.album = if album.is_empty() { None } else { Some(album) };
        }
    }
}

/// A fully compiled transform configuration for one source or client.
#[derive(Debug, Clone, Default)]
pub struct PlayTransform {
    pre_compare: Vec<Hook>,
    compare_candidate: Vec<Hook>,
    compare_existing: Vec<Hook>,
    post_compare: Vec<Hook>,
    pub log: LogMode,
}

impl PlayTransform {
    /// Compile the raw config into the rule tree the workers run against.
    ///
    /// Invalid regexes and unknown log modes are config errors: the
    /// component stays uninitialized instead of failing per-play.
    pub fn compile(cfg: &PlayTransformConfig) -> Result<Self> {
        let compile_stage = |stage: Option<&OneOrMany<HookConfig>>| -> Result<Vec<Hook>> {
            stage
                .map(|s| s.as_slice().iter().map(Hook::compile).collect())
                .unwrap_or_else(|| Ok(Vec::new()))
        };

        let (compare_candidate, compare_existing) = match &cfg.compare {
            Some(hooks) => (
                compile_stage(hooks.candidate.as_ref())?,
                compile_stage(hooks.existing.as_ref())?,
            ),
            None => (Vec::new(), Vec::new()),
        };

        let log = match &cfg.log {
            None | Some(LogConfig::Flag(false)) => LogMode::Off,
            Some(LogConfig::Flag(true)) => LogMode::Diff,
            Some(LogConfig::Mode(mode)) if mode == "all" => LogMode::All,
            Some(LogConfig::Mode(other)) => {
                return Err(Error::Config(format!(
                    "unknown transform log mode {:?} (expected true, false or \"all\")",
                    other
                )))
            }
        };

        Ok(Self {
            pre_compare: compile_stage(cfg.pre_compare.as_ref())?,
            compare_candidate,
            compare_existing,
            post_compare: compile_stage(cfg.post_compare.as_ref())?,
            log,
        })
    }

    fn hooks(&self, stage: Stage) -> &[Hook] {
        match stage {
            Stage::PreCompare => &self.pre_compare,
            Stage::CompareCandidate => &self.compare_candidate,
            Stage::CompareExisting => &self.compare_existing,
            Stage::PostCompare => &self.post_compare,
        }
    }

    /// Whether any hook is configured for the stage.
    pub fn has_stage(&self, stage: Stage) -> bool {
        !self.hooks(stage).is_empty()
    }

    /// Apply the stage's hook chain: the output play of hook *i* is the
    /// input of hook *i + 1*.
    ///
    /// Returns `None` when the rules removed every artist; the caller drops
    /// the play and surfaces a warning. Any other emptied field is simply
    /// unset on the returned play.
    pub fn apply(&self, stage: Stage, play: &Play, component: &str) -> Option<Play> {
        let hooks = self.hooks(stage);
        if hooks.is_empty() {
            return Some(play.clone());
        }

        let mut current = play.clone();
        for hook in hooks {
            let before = (self.log == LogMode::All).then(|| current.describe());
            hook.apply(&mut current);
            if let Some(before) = before {
                let after = current.describe();
                if before != after {
                    tracing::info!(
                        component,
                        stage = %stage,
                        before = %before,
                        after = %after,
                        "transform hook applied"
                    );
                }
            }
        }
        current.prune_empty();

        if self.log == LogMode::Diff {
            let before = play.describe();
            let after = current.describe();
            if before != after {
                tracing::info!(
                    component,
                    stage = %stage,
                    before = %before,
                    after = %after,
                    "transform applied"
                );
            }
        }

        if current.data.artists.is_empty() && !play.data.artists.is_empty() {
            tracing::warn!(
                component,
                stage = %stage,
                play = %play.describe(),
                "transform removed every artist, dropping play"
            );
            return None;
        }
        Some(current)
    }
}

//! Decision core for a synthetic chess opponent: consults an external
//! analysis engine, then degrades its choice to a target Elo through book
//! habits, calibrated imperfection, and temperature-weighted sampling.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const ELO_FLOOR: u32 = 400;
pub const ELO_CEILING: u32 = 2500;

pub const REASON_WEIGHTED: &str = "engine:weighted";
pub const REASON_FALLBACK: &str = "engine:fallback";
pub const REASON_DEV_FORCED: &str = "engine:dev-forced";
pub const REASON_DEV_NOISE: &str = "engine:dev-noise";

#[derive(Debug, Error)]
pub enum PickError {
    #[error("no legal moves in position")]
    NoLegalMoves,
    #[error("pick cancelled")]
    Cancelled,
    #[error("invalid opening data: {0}")]
    BookData(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine transport failed: {0}")]
    Transport(String),
    #[error("analysis timed out")]
    Timeout,
    #[error("analysis cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Default for Side {
    fn default() -> Self {
        Side::White
    }
}

// ---------------- Position model contract ----------------

/// Board-rules collaborator. The core never implements chess itself; every
/// legality question is delegated here. Moves cross the boundary as
/// coordinate-notation strings ("e2e4", "e7e8q").
pub trait Position: Send + Sync {
    fn duplicate(&self) -> Box<dyn Position>;
    /// Engine-facing description of the position (typically FEN).
    fn notation(&self) -> String;
    fn side_to_move(&self) -> Side;
    fn legal_moves(&self) -> Vec<String>;
    /// Resolve a token in any accepted notation to canonical coordinate
    /// notation, if it names a move that is legal here.
    fn resolve(&self, token: &str) -> Option<String>;
    /// Apply a coordinate-notation move; false if it is not legal.
    fn apply(&mut self, mv: &str) -> bool;
    fn is_terminal(&self) -> bool;
}

// ---------------- Analysis engine contract ----------------

/// Engine score, normalized at the adapter boundary before the picker sees
/// it. Mate distances are linearized so the rest of the core only deals in
/// centipawn integers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineScore {
    Cp(i32),
    Mate(i32),
}

impl EngineScore {
    pub fn linearized(self) -> i32 {
        match self {
            EngineScore::Cp(v) => v,
            EngineScore::Mate(d) => {
                let mag = 10_000 - d.abs().min(99) * 100;
                if d >= 0 {
                    mag
                } else {
                    -mag
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineLine {
    pub mv: String,
    pub score: EngineScore,
}

/// External analysis engine. `analyse` ranks up to `lines` distinct moves
/// for the side to move, spending roughly `time_ms`, and must observe the
/// cancellation token at its own suspension points.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn analyse(
        &self,
        position: &str,
        lines: u32,
        time_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<EngineLine>, EngineError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PickerCandidate {
    pub mv: String,
    pub score: i32,
    /// Centipawns below the best candidate in the same search; 0 for the top.
    pub drop: i32,
}

/// Dedup per move keeping the higher score, sort best-first, attach drops.
fn candidate_pool(lines: Vec<EngineLine>) -> Vec<PickerCandidate> {
    let mut merged: Vec<(String, i32)> = Vec::with_capacity(lines.len());
    for line in lines {
        let score = line.score.linearized();
        match merged
            .iter_mut()
            .find(|(mv, _)| mv.eq_ignore_ascii_case(&line.mv))
        {
            Some(entry) => entry.1 = entry.1.max(score),
            None => merged.push((line.mv, score)),
        }
    }
    merged.sort_by(|a, b| b.1.cmp(&a.1));
    let best = merged.first().map(|(_, s)| *s).unwrap_or(0);
    merged
        .into_iter()
        .map(|(mv, score)| PickerCandidate {
            mv,
            score,
            drop: best - score,
        })
        .collect()
}

// ---------------- Deterministic random source ----------------

/// Seed accepted on a pick request: a number, or a phrase hashed with a
/// stable fold so test fixtures can name their streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seed {
    Number(u64),
    Phrase(String),
}

impl From<u64> for Seed {
    fn from(v: u64) -> Self {
        Seed::Number(v)
    }
}

impl From<&str> for Seed {
    fn from(v: &str) -> Self {
        Seed::Phrase(v.to_string())
    }
}

// FNV-1a; std's DefaultHasher is not stable across releases.
fn hash_phrase(phrase: &str) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for b in phrase.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Random source behind every stochastic decision in the core. Seeded and
/// entropy-backed construction share one stream type; the entropy variant
/// draws its seed up front so the trace can always report a replayable seed.
pub struct PickRng {
    seed: u64,
    rng: StdRng,
}

impl PickRng {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_seed(seed: &Seed) -> Self {
        match seed {
            Seed::Number(n) => Self::seeded(*n),
            Seed::Phrase(p) => Self::seeded(hash_phrase(p)),
        }
    }

    pub fn entropy() -> Self {
        Self::seeded(rand::thread_rng().gen())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Probability gate. Degenerate rates skip the draw so disabled
    /// mechanisms leave the stream untouched.
    pub fn chance(&mut self, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.rng.gen::<f64>() < p
    }

    pub fn index(&mut self, len: usize) -> usize {
        self.rng.gen_range(0..len)
    }

    pub fn weighted(&mut self, weights: &[f64]) -> usize {
        let total: f64 = weights.iter().map(|w| w.max(0.0)).sum();
        if total <= 0.0 {
            return 0;
        }
        let mut r = self.rng.gen_range(0.0..total);
        for (i, w) in weights.iter().enumerate() {
            let w = w.max(0.0);
            if r <= w {
                return i;
            }
            r -= w;
        }
        weights.len() - 1
    }
}

impl fmt::Debug for PickRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickRng").field("seed", &self.seed).finish()
    }
}

// ---------------- Strength configuration ----------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EarlyExit {
    pub min_plies: usize,
    pub probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookConfig {
    pub max_plies: usize,
    pub top_lines: usize,
    /// Strong bands stick to the mainline deterministically; weaker bands
    /// draw weight-proportionally across the repertoire.
    pub favor_common: bool,
    #[serde(default)]
    pub early_exit: Option<EarlyExit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressiveWidening {
    pub drop_steps: Vec<i32>,
    pub line_steps: Vec<u32>,
    pub time_steps: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BandConfig {
    pub id: String,
    /// Inclusive Elo range.
    pub elo: (u32, u32),
    pub min_time_ms: u64,
    pub max_lines: u32,
    pub base_max_drop: i32,
    /// Sampling temperature; higher sharpens preference for the top move.
    pub k: f64,
    pub book: BookConfig,
    pub widening: ProgressiveWidening,
    /// Tolerance for the last-resort pool once every widening step is spent.
    pub floor_drop: i32,
}

impl BandConfig {
    pub fn contains(&self, elo: u32) -> bool {
        self.elo.0 <= elo && elo <= self.elo.1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpeningPhase {
    pub plies: usize,
    pub time_ms: u64,
    pub lines: u32,
    pub drop_relax: i32,
}

/// Self-calibration parameters for the designated dev band.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevBandConfig {
    pub elo: (u32, u32),
    pub target_gap: f64,
    pub gap_epsilon: f64,
    pub drop_adjust_bounds: (i32, i32),
    pub k_scale_bounds: (f64, f64),
    pub k_scale_step: f64,
    pub drop_adjust_step: i32,
    pub forced_random_rate: f64,
    pub forced_random_min_drop: i32,
    pub noise_rate: f64,
    pub noise_min_drop: i32,
    pub noise_pool: usize,
    pub phase: OpeningPhase,
}

impl DevBandConfig {
    pub fn contains(&self, elo: u32) -> bool {
        self.elo.0 <= elo && elo <= self.elo.1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImperfectionProfile {
    /// Inclusive Elo range; first matching profile wins.
    pub elo: (u32, u32),
    pub kind: String,
    pub rate: f64,
    pub min_drop: i32,
    pub max_drop: i32,
    pub take_worst: usize,
    pub random_move_rate: f64,
}

/// The whole strength table. Data, not code: callers may override it
/// wholesale to test alternate tunings without touching the algorithm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PickerConfig {
    pub max_time_ms: u64,
    /// Global cap on book depth, on top of each band's own limit.
    pub default_book_plies: usize,
    pub default_band: String,
    pub bands: Vec<BandConfig>,
    pub dev: DevBandConfig,
    pub imperfection: Vec<ImperfectionProfile>,
}

impl PickerConfig {
    pub fn band_for_elo(&self, elo: u32) -> &BandConfig {
        let elo = elo.clamp(ELO_FLOOR, ELO_CEILING);
        self.bands
            .iter()
            .find(|b| b.contains(elo))
            .or_else(|| self.bands.iter().find(|b| b.id == self.default_band))
            .or_else(|| self.bands.first())
            .expect("picker config has at least one band")
    }

    pub fn imperfection_for_elo(&self, elo: u32) -> Option<&ImperfectionProfile> {
        let elo = elo.clamp(ELO_FLOOR, ELO_CEILING);
        self.imperfection
            .iter()
            .find(|p| p.elo.0 <= elo && elo <= p.elo.1)
    }
}

impl Default for PickerConfig {
    fn default() -> Self {
        Self {
            max_time_ms: 4_000,
            default_book_plies: 18,
            default_band: "intermediate".to_string(),
            bands: vec![
                BandConfig {
                    id: "novice".to_string(),
                    elo: (400, 799),
                    min_time_ms: 150,
                    max_lines: 5,
                    base_max_drop: 250,
                    k: 0.004,
                    book: BookConfig {
                        max_plies: 6,
                        top_lines: 4,
                        favor_common: false,
                        early_exit: Some(EarlyExit {
                            min_plies: 2,
                            probability: 0.35,
                        }),
                    },
                    widening: ProgressiveWidening {
                        drop_steps: vec![150, 250],
                        line_steps: vec![2],
                        time_steps: vec![300],
                    },
                    floor_drop: 1_200,
                },
                BandConfig {
                    id: "casual".to_string(),
                    elo: (800, 1_099),
                    min_time_ms: 200,
                    max_lines: 5,
                    base_max_drop: 180,
                    k: 0.008,
                    book: BookConfig {
                        max_plies: 8,
                        top_lines: 4,
                        favor_common: false,
                        early_exit: Some(EarlyExit {
                            min_plies: 4,
                            probability: 0.25,
                        }),
                    },
                    widening: ProgressiveWidening {
                        drop_steps: vec![120, 200],
                        line_steps: vec![2],
                        time_steps: vec![300],
                    },
                    floor_drop: 1_000,
                },
                BandConfig {
                    id: "club".to_string(),
                    elo: (1_100, 1_399),
                    min_time_ms: 250,
                    max_lines: 4,
                    base_max_drop: 140,
                    k: 0.012,
                    book: BookConfig {
                        max_plies: 10,
                        top_lines: 3,
                        favor_common: false,
                        early_exit: Some(EarlyExit {
                            min_plies: 6,
                            probability: 0.15,
                        }),
                    },
                    widening: ProgressiveWidening {
                        drop_steps: vec![100, 160],
                        line_steps: vec![1, 2],
                        time_steps: vec![400],
                    },
                    floor_drop: 800,
                },
                BandConfig {
                    id: "intermediate".to_string(),
                    elo: (1_400, 1_699),
                    min_time_ms: 300,
                    max_lines: 4,
                    base_max_drop: 100,
                    k: 0.018,
                    book: BookConfig {
                        max_plies: 12,
                        top_lines: 3,
                        favor_common: false,
                        early_exit: Some(EarlyExit {
                            min_plies: 8,
                            probability: 0.10,
                        }),
                    },
                    widening: ProgressiveWidening {
                        drop_steps: vec![80, 140],
                        line_steps: vec![1, 2],
                        time_steps: vec![400],
                    },
                    floor_drop: 700,
                },
                BandConfig {
                    id: "advanced".to_string(),
                    elo: (1_700, 1_999),
                    min_time_ms: 400,
                    max_lines: 3,
                    base_max_drop: 70,
                    k: 0.025,
                    book: BookConfig {
                        max_plies: 14,
                        top_lines: 2,
                        favor_common: true,
                        early_exit: Some(EarlyExit {
                            min_plies: 10,
                            probability: 0.08,
                        }),
                    },
                    widening: ProgressiveWidening {
                        drop_steps: vec![60, 100],
                        line_steps: vec![1],
                        time_steps: vec![500],
                    },
                    floor_drop: 500,
                },
                BandConfig {
                    id: "expert".to_string(),
                    elo: (2_000, 2_299),
                    min_time_ms: 500,
                    max_lines: 3,
                    base_max_drop: 45,
                    k: 0.035,
                    book: BookConfig {
                        max_plies: 16,
                        top_lines: 2,
                        favor_common: true,
                        early_exit: None,
                    },
                    widening: ProgressiveWidening {
                        drop_steps: vec![40, 80],
                        line_steps: vec![1],
                        time_steps: vec![600],
                    },
                    floor_drop: 400,
                },
                BandConfig {
                    id: "master".to_string(),
                    elo: (2_300, 2_500),
                    min_time_ms: 650,
                    max_lines: 2,
                    base_max_drop: 25,
                    k: 0.050,
                    book: BookConfig {
                        max_plies: 18,
                        top_lines: 1,
                        favor_common: true,
                        early_exit: None,
                    },
                    widening: ProgressiveWidening {
                        drop_steps: vec![30, 50],
                        line_steps: vec![1],
                        time_steps: vec![800],
                    },
                    floor_drop: 300,
                },
            ],
            dev: DevBandConfig {
                elo: (1_400, 1_699),
                target_gap: 35.0,
                gap_epsilon: 5.0,
                drop_adjust_bounds: (-40, 80),
                k_scale_bounds: (0.5, 2.0),
                k_scale_step: 0.05,
                drop_adjust_step: 5,
                forced_random_rate: 0.04,
                forced_random_min_drop: 120,
                noise_rate: 0.10,
                noise_min_drop: 40,
                noise_pool: 3,
                phase: OpeningPhase {
                    plies: 12,
                    time_ms: 900,
                    lines: 5,
                    drop_relax: 60,
                },
            },
            imperfection: vec![
                ImperfectionProfile {
                    elo: (400, 899),
                    kind: "lapse".to_string(),
                    rate: 0.22,
                    min_drop: 60,
                    max_drop: 450,
                    take_worst: 4,
                    random_move_rate: 0.25,
                },
                ImperfectionProfile {
                    elo: (900, 1_399),
                    kind: "slip".to_string(),
                    rate: 0.15,
                    min_drop: 50,
                    max_drop: 300,
                    take_worst: 3,
                    random_move_rate: 0.12,
                },
                ImperfectionProfile {
                    elo: (1_400, 1_899),
                    kind: "drift".to_string(),
                    rate: 0.08,
                    min_drop: 40,
                    max_drop: 200,
                    take_worst: 3,
                    random_move_rate: 0.05,
                },
                ImperfectionProfile {
                    elo: (1_900, 2_299),
                    kind: "waver".to_string(),
                    rate: 0.04,
                    min_drop: 30,
                    max_drop: 120,
                    take_worst: 2,
                    random_move_rate: 0.0,
                },
            ],
        }
    }
}

/// Think-time anchors; budgets between anchors interpolate linearly.
const TIME_ANCHORS: &[(u32, u64)] = &[
    (400, 250),
    (800, 420),
    (1_200, 700),
    (1_600, 1_150),
    (2_000, 1_900),
    (2_500, 3_200),
];

fn interpolated_time_ms(elo: u32) -> u64 {
    let first = TIME_ANCHORS[0];
    if elo <= first.0 {
        return first.1;
    }
    for pair in TIME_ANCHORS.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if elo <= hi.0 {
            let span = (hi.0 - lo.0) as f64;
            let t = (elo - lo.0) as f64 / span;
            return lo.1 + ((hi.1 - lo.1) as f64 * t).round() as u64;
        }
    }
    TIME_ANCHORS[TIME_ANCHORS.len() - 1].1
}

fn initial_line_count(elo: u32, time_ms: u64, band: &BandConfig) -> u32 {
    let base = if elo < 1_000 {
        4
    } else if elo < 1_800 {
        3
    } else {
        2
    };
    let capped = if time_ms < 400 { base.min(2) } else { base };
    capped.clamp(1, band.max_lines.max(1))
}

// ---------------- Opening book ----------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineRecord {
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub moves: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpeningRecord {
    pub eco: String,
    pub name: String,
    #[serde(default)]
    pub variation: Option<String>,
    pub side: Side,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub lines: Vec<LineRecord>,
}

fn default_weight() -> f64 {
    1.0
}

/// One replay-validated book line, moves in coordinate notation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NormalizedOpeningLine {
    pub eco: String,
    pub name: String,
    pub variation: Option<String>,
    pub side: Side,
    pub opening_weight: f64,
    pub line_weight: f64,
    pub moves: Vec<String>,
}

impl NormalizedOpeningLine {
    pub fn title(&self) -> String {
        match &self.variation {
            Some(v) => format!("{} ({v})", self.name),
            None => self.name.clone(),
        }
    }
}

pub struct BookQuery<'a> {
    pub side: Side,
    pub history: &'a [String],
    pub position: &'a dyn Position,
    pub max_plies: usize,
    pub top_lines: usize,
    pub favor_common: bool,
    pub exit_early: Option<&'a EarlyExit>,
}

#[derive(Debug, Clone)]
pub struct BookChoice {
    pub mv: String,
    pub line: Arc<NormalizedOpeningLine>,
}

/// Named opening lines grouped for fast prefix lookup. Read-only after
/// construction; safe to share across pickers.
pub struct OpeningBookIndex {
    by_first: HashMap<(Side, String), Vec<Arc<NormalizedOpeningLine>>>,
    by_side: HashMap<Side, Vec<Arc<NormalizedOpeningLine>>>,
}

static BUILTIN_OPENINGS: Lazy<Vec<OpeningRecord>> = Lazy::new(|| {
    serde_json::from_str(include_str!("../data/openings.json"))
        .expect("built-in opening data parses")
});

pub fn builtin_openings() -> &'static [OpeningRecord] {
    &BUILTIN_OPENINGS
}

pub fn records_from_json(json: &str) -> Result<Vec<OpeningRecord>, PickError> {
    serde_json::from_str(json).map_err(|e| PickError::BookData(e.to_string()))
}

pub fn records_from_path(path: &Path) -> Result<Vec<OpeningRecord>, PickError> {
    let raw = fs::read_to_string(path).map_err(|e| PickError::BookData(e.to_string()))?;
    records_from_json(&raw)
}

impl OpeningBookIndex {
    /// Build from source records. Every line is replayed on a fresh start
    /// position; lines that fail to replay are dropped silently so malformed
    /// data can never crash a pick.
    pub fn from_records(records: &[OpeningRecord], start: &dyn Position) -> Self {
        let mut by_first: HashMap<(Side, String), Vec<Arc<NormalizedOpeningLine>>> = HashMap::new();
        let mut by_side: HashMap<Side, Vec<Arc<NormalizedOpeningLine>>> = HashMap::new();
        for record in records {
            for line in &record.lines {
                let Some(normalized) = normalize_line(record, line, start) else {
                    debug!(
                        eco = %record.eco,
                        name = %record.name,
                        "dropping opening line that fails to replay"
                    );
                    continue;
                };
                let normalized = Arc::new(normalized);
                let first = normalized.moves[0].clone();
                by_first
                    .entry((record.side, first))
                    .or_default()
                    .push(Arc::clone(&normalized));
                by_side.entry(record.side).or_default().push(normalized);
            }
        }
        Self { by_first, by_side }
    }

    pub fn builtin(start: &dyn Position) -> Self {
        Self::from_records(builtin_openings(), start)
    }

    pub fn len(&self) -> usize {
        self.by_side.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_side.is_empty()
    }

    /// All lines whose prefix equals `history`; empty history returns the
    /// whole repertoire for the side.
    pub fn lookup(&self, side: Side, history: &[String]) -> Vec<Arc<NormalizedOpeningLine>> {
        if history.is_empty() {
            return self.by_side.get(&side).cloned().unwrap_or_default();
        }
        let key = (side, history[0].to_ascii_lowercase());
        let Some(bucket) = self.by_first.get(&key) else {
            return Vec::new();
        };
        bucket
            .iter()
            .filter(|line| prefix_matches(&line.moves, history))
            .cloned()
            .collect()
    }

    /// Choose the next book move for the query, or None when out of book.
    /// The returned move is re-validated against the live position; any
    /// mismatch with stale data yields None, never an error.
    pub fn pick(&self, query: &BookQuery<'_>, rng: &mut PickRng) -> Option<BookChoice> {
        let ply = query.history.len();
        if ply >= query.max_plies {
            return None;
        }
        if let Some(gate) = query.exit_early {
            if ply >= gate.min_plies && rng.chance(gate.probability) {
                return None;
            }
        }

        let matches: Vec<Arc<NormalizedOpeningLine>> = self
            .lookup(query.side, query.history)
            .into_iter()
            .filter(|line| line.moves.len() > ply)
            .collect();
        if matches.is_empty() {
            return None;
        }

        // Group by opening identity; insertion order keeps selection
        // deterministic for a fixed seed.
        let mut groups: Vec<(String, f64, Vec<Arc<NormalizedOpeningLine>>)> = Vec::new();
        for line in matches {
            let key = format!("{}|{}", line.eco, line.name);
            match groups.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, _, lines)) => lines.push(line),
                None => groups.push((key, line.opening_weight, vec![line])),
            }
        }

        let group = if query.favor_common {
            groups
                .iter()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))?
        } else {
            let weights: Vec<f64> = groups.iter().map(|g| g.1).collect();
            &groups[rng.weighted(&weights)]
        };

        let mut lines = group.2.clone();
        lines.sort_by(|a, b| {
            b.line_weight
                .partial_cmp(&a.line_weight)
                .unwrap_or(Ordering::Equal)
        });
        if query.favor_common {
            lines.truncate(query.top_lines.max(1));
        }
        let weights: Vec<f64> = lines.iter().map(|l| l.line_weight).collect();
        let line = Arc::clone(&lines[rng.weighted(&weights)]);

        let token = line.moves.get(ply)?;
        let mv = query.position.resolve(token)?;
        Some(BookChoice { mv, line })
    }
}

impl fmt::Debug for OpeningBookIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpeningBookIndex")
            .field("lines", &self.len())
            .finish()
    }
}

fn prefix_matches(moves: &[String], history: &[String]) -> bool {
    history.len() <= moves.len()
        && history
            .iter()
            .zip(moves)
            .all(|(h, m)| h.eq_ignore_ascii_case(m))
}

fn normalize_line(
    record: &OpeningRecord,
    line: &LineRecord,
    start: &dyn Position,
) -> Option<NormalizedOpeningLine> {
    if line.moves.is_empty() {
        return None;
    }
    let mut pos = start.duplicate();
    let mut moves = Vec::with_capacity(line.moves.len());
    for token in &line.moves {
        let mv = pos.resolve(token)?;
        if !pos.apply(&mv) {
            return None;
        }
        moves.push(mv);
    }
    Some(NormalizedOpeningLine {
        eco: record.eco.clone(),
        name: record.name.clone(),
        variation: record.variation.clone(),
        side: record.side,
        opening_weight: record.weight,
        line_weight: line.weight,
        moves,
    })
}

// ---------------- Move picker ----------------

/// The only cross-call state in the core. Evolved on a local copy during a
/// pick and committed on successful return, so a cancelled or failed pick
/// leaves it untouched.
#[derive(Debug, Clone, PartialEq)]
struct DevTuningState {
    avg_gap: f64,
    k_scale: f64,
    drop_adjust: i32,
    last_history_len: usize,
}

impl DevTuningState {
    fn fresh(target_gap: f64) -> Self {
        Self {
            avg_gap: target_gap,
            k_scale: 1.0,
            drop_adjust: 0,
            last_history_len: 0,
        }
    }

    fn reset(&mut self, target_gap: f64) {
        *self = Self::fresh(target_gap);
    }
}

/// Machine-readable decision trace attached to every pick.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PickMeta {
    pub seed: u64,
    pub band: String,
    pub history_len: usize,
    pub time_ms: u64,
    pub lines: u32,
    pub max_drop: i32,
    pub drop_bumps: Vec<i32>,
    pub multipv_bumps: Vec<u32>,
    pub time_bumps: Vec<u64>,
    pub book: Option<String>,
    pub imperfection: Option<String>,
    pub k: f64,
    pub candidates: Vec<PickerCandidate>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PickedMove {
    pub mv: String,
    pub reason: String,
    pub meta: PickMeta,
}

pub struct PickRequest<'a> {
    pub position: &'a dyn Position,
    pub elo: u32,
    pub history: &'a [String],
    pub seed: Option<Seed>,
    pub cancel: CancellationToken,
}

impl<'a> PickRequest<'a> {
    pub fn new(position: &'a dyn Position, elo: u32, history: &'a [String]) -> Self {
        Self {
            position,
            elo,
            history,
            seed: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn seeded(mut self, seed: impl Into<Seed>) -> Self {
        self.seed = Some(seed.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The orchestrator. Owns the tuning state exclusively; `pick` takes
/// `&mut self`, so the borrow checker serializes calls per instance. Book
/// and config are shared, so one of each can drive both sides of a game.
pub struct MovePicker<E> {
    engine: E,
    config: Arc<PickerConfig>,
    book: Arc<OpeningBookIndex>,
    tuning: DevTuningState,
}

impl<E> fmt::Debug for MovePicker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MovePicker")
            .field("bands", &self.config.bands.len())
            .field("book_lines", &self.book.len())
            .field("tuning", &self.tuning)
            .finish()
    }
}

impl<E: AnalysisEngine> MovePicker<E> {
    pub fn new(engine: E, config: Arc<PickerConfig>, book: Arc<OpeningBookIndex>) -> Self {
        let tuning = DevTuningState::fresh(config.dev.target_gap);
        Self {
            engine,
            config,
            book,
            tuning,
        }
    }

    /// Select one move for the side to move. Returns the move, a short
    /// machine-readable reason, and the full decision trace.
    pub async fn pick(&mut self, req: PickRequest<'_>) -> Result<PickedMove, PickError> {
        if req.cancel.is_cancelled() {
            return Err(PickError::Cancelled);
        }
        let legal = req.position.legal_moves();
        if req.position.is_terminal() || legal.is_empty() {
            return Err(PickError::NoLegalMoves);
        }

        let mut rng = match &req.seed {
            Some(seed) => PickRng::from_seed(seed),
            None => PickRng::entropy(),
        };
        let config = Arc::clone(&self.config);
        let book = Arc::clone(&self.book);

        // 1. Band and budget resolution.
        let elo = req.elo.clamp(ELO_FLOOR, ELO_CEILING);
        let band = config.band_for_elo(elo);
        let mut time_ms = interpolated_time_ms(elo)
            .min(config.max_time_ms)
            .max(band.min_time_ms);
        let mut lines = initial_line_count(elo, time_ms, band);
        let mut tolerance = band.base_max_drop;
        let mut k = band.k;

        // 2. Calibration adjustment, evolved on a local copy.
        let dev = &config.dev;
        let in_dev = dev.contains(elo);
        let mut session = self.tuning.clone();
        if in_dev {
            if req.history.len() < session.last_history_len {
                session.reset(dev.target_gap);
            }
            let w = phase_weight(req.history.len(), dev.phase.plies);
            if w > 0.0 {
                time_ms += (dev.phase.time_ms.saturating_sub(time_ms) as f64 * w) as u64;
                lines += (dev.phase.lines.saturating_sub(lines) as f64 * w) as u32;
                tolerance += (dev.phase.drop_relax as f64 * w).round() as i32;
            }
            tolerance += session.drop_adjust;
            let (k_lo, k_hi) = dev.k_scale_bounds;
            k *= session.k_scale.clamp(k_lo, k_hi);
        } else {
            session.reset(dev.target_gap);
        }
        session.last_history_len = req.history.len();
        tolerance = tolerance.max(0);
        time_ms = time_ms.min(config.max_time_ms);

        // 3. Book attempt; a hit costs no engine call.
        let side = req.position.side_to_move();
        let book_query = BookQuery {
            side,
            history: req.history,
            position: req.position,
            max_plies: band.book.max_plies.min(config.default_book_plies),
            top_lines: band.book.top_lines,
            favor_common: band.book.favor_common,
            exit_early: band.book.early_exit.as_ref(),
        };
        if let Some(choice) = book.pick(&book_query, &mut rng) {
            debug!(line = %choice.line.title(), mv = %choice.mv, "book move");
            let meta = PickMeta {
                seed: rng.seed(),
                band: band.id.clone(),
                history_len: req.history.len(),
                time_ms,
                lines,
                max_drop: tolerance,
                drop_bumps: Vec::new(),
                multipv_bumps: Vec::new(),
                time_bumps: Vec::new(),
                book: Some(choice.line.title()),
                imperfection: None,
                k,
                candidates: Vec::new(),
            };
            let reason = format!("book:{}", choice.line.name);
            self.tuning = session;
            return Ok(PickedMove {
                mv: choice.mv,
                reason,
                meta,
            });
        }

        // 4. Progressive widening: drop tolerance first, then extra lines,
        // then extra time; each step at most once per pick.
        let position_str = req.position.notation();
        let mut drop_bumps = Vec::new();
        let mut multipv_bumps = Vec::new();
        let mut time_bumps = Vec::new();
        let mut drop_steps = band.widening.drop_steps.iter().copied();
        let mut line_steps = band.widening.line_steps.iter().copied();
        let mut time_steps = band.widening.time_steps.iter().copied();

        let mut all =
            query_candidates(&self.engine, &position_str, lines, time_ms, &req.cancel).await?;
        let mut pool = within_tolerance(&all, tolerance);
        while pool.is_empty() {
            if let Some(bump) = drop_steps.next() {
                tolerance += bump;
                drop_bumps.push(bump);
                pool = within_tolerance(&all, tolerance);
            } else if let Some(bump) = line_steps.next() {
                lines += bump;
                multipv_bumps.push(bump);
                debug!(lines, "widening: extra engine lines");
                all = query_candidates(&self.engine, &position_str, lines, time_ms, &req.cancel)
                    .await?;
                pool = within_tolerance(&all, tolerance);
            } else if let Some(bump) = time_steps.next() {
                time_ms = (time_ms + bump).min(config.max_time_ms);
                time_bumps.push(bump);
                debug!(time_ms, "widening: extra engine time");
                all = query_candidates(&self.engine, &position_str, lines, time_ms, &req.cancel)
                    .await?;
                pool = within_tolerance(&all, tolerance);
            } else {
                // Last resort: the unfiltered pool, bounded by the band's
                // floor tolerance when that still leaves something.
                pool = within_tolerance(&all, band.floor_drop);
                if pool.is_empty() {
                    pool = all.clone();
                }
                break;
            }
        }

        // 5. Engine produced nothing at all: degrade to a random legal move
        // rather than surfacing an error.
        if pool.is_empty() {
            let mv = legal[rng.index(legal.len())].clone();
            warn!(%mv, "engine returned no candidates; falling back to random legal move");
            let meta = PickMeta {
                seed: rng.seed(),
                band: band.id.clone(),
                history_len: req.history.len(),
                time_ms,
                lines,
                max_drop: tolerance,
                drop_bumps,
                multipv_bumps,
                time_bumps,
                book: None,
                imperfection: None,
                k,
                candidates: Vec::new(),
            };
            self.tuning = session;
            return Ok(PickedMove {
                mv,
                reason: REASON_FALLBACK.to_string(),
                meta,
            });
        }

        // 6. Imperfection rules, first match wins.
        let mut imperfection: Option<String> = None;
        let mut reason = REASON_WEIGHTED.to_string();
        let mut chosen: Option<PickerCandidate> = None;

        if in_dev {
            if let Some(pick) = dev_forced_rule(&pool, &legal, dev, &mut rng) {
                imperfection = Some("dev-forced".to_string());
                reason = REASON_DEV_FORCED.to_string();
                chosen = Some(pick);
            } else if let Some(pick) = dev_noise_rule(&pool, dev, &mut rng) {
                imperfection = Some("dev-noise".to_string());
                reason = REASON_DEV_NOISE.to_string();
                chosen = Some(pick);
            }
        }
        if chosen.is_none() {
            if let Some(profile) = config.imperfection_for_elo(elo) {
                if let Some(pick) = profile_rule(&pool, &legal, profile, &mut rng) {
                    imperfection = Some(profile.kind.clone());
                    reason = format!("engine:{}", profile.kind);
                    chosen = Some(pick);
                }
            }
        }

        // 7. Temperature-weighted draw over the surviving pool.
        let weighted_pick = chosen.is_none();
        let chosen = match chosen {
            Some(c) => c,
            None => {
                let weights: Vec<f64> = pool
                    .iter()
                    .map(|c| (-k * c.drop as f64).exp())
                    .collect();
                pool[rng.weighted(&weights)].clone()
            }
        };

        // 8. Feedback: only genuine weighted picks inform the controller.
        if in_dev && weighted_pick {
            let gap = chosen.drop as f64;
            session.avg_gap = session.avg_gap * 0.9 + gap * 0.1;
            let error = session.avg_gap - dev.target_gap;
            if error.abs() > dev.gap_epsilon {
                let (k_lo, k_hi) = dev.k_scale_bounds;
                let (d_lo, d_hi) = dev.drop_adjust_bounds;
                if error > 0.0 {
                    session.k_scale = (session.k_scale + dev.k_scale_step).clamp(k_lo, k_hi);
                    session.drop_adjust =
                        (session.drop_adjust - dev.drop_adjust_step).clamp(d_lo, d_hi);
                } else {
                    session.k_scale = (session.k_scale - dev.k_scale_step).clamp(k_lo, k_hi);
                    session.drop_adjust =
                        (session.drop_adjust + dev.drop_adjust_step).clamp(d_lo, d_hi);
                }
            }
        }

        let meta = PickMeta {
            seed: rng.seed(),
            band: band.id.clone(),
            history_len: req.history.len(),
            time_ms,
            lines,
            max_drop: tolerance,
            drop_bumps,
            multipv_bumps,
            time_bumps,
            book: None,
            imperfection,
            k,
            candidates: pool,
        };
        self.tuning = session;
        Ok(PickedMove {
            mv: chosen.mv,
            reason,
            meta,
        })
    }
}

/// Linearly decaying influence of the opening phase over the first N plies.
fn phase_weight(ply: usize, phase_plies: usize) -> f64 {
    if phase_plies == 0 || ply >= phase_plies {
        return 0.0;
    }
    (phase_plies - ply) as f64 / phase_plies as f64
}

fn within_tolerance(all: &[PickerCandidate], tolerance: i32) -> Vec<PickerCandidate> {
    all.iter()
        .filter(|c| c.drop <= tolerance)
        .cloned()
        .collect()
}

async fn query_candidates<E: AnalysisEngine>(
    engine: &E,
    position: &str,
    lines: u32,
    time_ms: u64,
    cancel: &CancellationToken,
) -> Result<Vec<PickerCandidate>, PickError> {
    if cancel.is_cancelled() {
        return Err(PickError::Cancelled);
    }
    let result = engine.analyse(position, lines, time_ms, cancel).await;
    if cancel.is_cancelled() {
        return Err(PickError::Cancelled);
    }
    match result {
        Ok(engine_lines) => Ok(candidate_pool(engine_lines)),
        Err(EngineError::Cancelled) => Err(PickError::Cancelled),
        Err(err) => {
            // One-off engine hiccups are recovered by widening or the
            // random-legal fallback; never surfaced from here.
            warn!(error = %err, "engine query failed; treating as empty response");
            Ok(Vec::new())
        }
    }
}

/// Calibration-band forced error: the worst qualifying candidate, else a
/// legal move the engine never proposed.
fn dev_forced_rule(
    pool: &[PickerCandidate],
    legal: &[String],
    dev: &DevBandConfig,
    rng: &mut PickRng,
) -> Option<PickerCandidate> {
    if !rng.chance(dev.forced_random_rate) {
        return None;
    }
    if let Some(worst) = pool
        .iter()
        .rev()
        .find(|c| c.drop >= dev.forced_random_min_drop)
    {
        return Some(worst.clone());
    }
    let outside = moves_outside_pool(pool, legal);
    if outside.is_empty() {
        return None;
    }
    let mv = outside[rng.index(outside.len())].clone();
    Some(PickerCandidate {
        mv,
        score: 0,
        drop: 0,
    })
}

/// Calibration-band noise: uniform draw from the worst qualifying tail.
fn dev_noise_rule(
    pool: &[PickerCandidate],
    dev: &DevBandConfig,
    rng: &mut PickRng,
) -> Option<PickerCandidate> {
    if !rng.chance(dev.noise_rate) {
        return None;
    }
    let qualifying: Vec<&PickerCandidate> = pool
        .iter()
        .filter(|c| c.drop >= dev.noise_min_drop)
        .collect();
    if qualifying.is_empty() {
        return None;
    }
    let start = qualifying.len().saturating_sub(dev.noise_pool.max(1));
    let tail = &qualifying[start..];
    Some(tail[rng.index(tail.len())].clone())
}

/// Elo-keyed imperfection: sample the configured drop window, else the
/// worst few candidates, with a secondary chance of a fully random legal
/// move outside the engine's pool.
fn profile_rule(
    pool: &[PickerCandidate],
    legal: &[String],
    profile: &ImperfectionProfile,
    rng: &mut PickRng,
) -> Option<PickerCandidate> {
    if !rng.chance(profile.rate) {
        return None;
    }
    if rng.chance(profile.random_move_rate) {
        let outside = moves_outside_pool(pool, legal);
        if !outside.is_empty() {
            let mv = outside[rng.index(outside.len())].clone();
            return Some(PickerCandidate {
                mv,
                score: 0,
                drop: 0,
            });
        }
    }
    let window: Vec<&PickerCandidate> = pool
        .iter()
        .filter(|c| profile.min_drop <= c.drop && c.drop <= profile.max_drop)
        .collect();
    if !window.is_empty() {
        return Some(window[rng.index(window.len())].clone());
    }
    // Pool is already sorted best-first, so the worst candidates sit at the
    // end.
    let start = pool.len().saturating_sub(profile.take_worst.max(1));
    let tail = &pool[start..];
    Some(tail[rng.index(tail.len())].clone())
}

fn moves_outside_pool<'a>(pool: &[PickerCandidate], legal: &'a [String]) -> Vec<&'a String> {
    legal
        .iter()
        .filter(|mv| !pool.iter().any(|c| c.mv.eq_ignore_ascii_case(mv)))
        .collect()
}

// ---------------- Tests ----------------

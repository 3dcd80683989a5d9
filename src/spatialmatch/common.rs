use failure::{Error, Fail};
use fixedbitset::FixedBitSet;
use fxhash::FxHashMap;

use crate::spatialmatch::spatial;

/// Width of the index-position bitmasks (`bmask`, `allowed_idx`). Index
/// ordinals at or above this are rejected up front.
pub const MAX_INDEXES: usize = 128;

pub const DEFAULT_STACKABLE_LIMIT: usize = 100;
pub const DEFAULT_SPATIALMATCH_STACK_LIMIT: usize = 100;
pub const DEFAULT_PROXIMITY_RADIUS: f64 = 200.0;
pub const PARTIAL_NUMBER_RADIUS_MILES: f64 = 10.0;
pub const PARTIAL_NUMBER_SCOREDIST_BOOST: f64 = 300.0;

#[derive(Debug, Fail)]
pub enum SpatialmatchError {
    #[fail(display = "invalid options: {}", _0)]
    InvalidOptions(&'static str),
    #[fail(display = "index {} exceeds the bitmask width {}", idx, width)]
    IndexOutOfRange { idx: u16, width: usize },
    #[fail(display = "coalesce failed: {}", _0)]
    CoalesceFailure(String),
    #[fail(display = "projection failed: {}", _0)]
    ProjectionFailure(String),
}

#[inline]
pub fn masks_overlap(a: u32, b: u32) -> bool {
    a & b != 0
}

#[inline]
pub fn mask_union(a: u32, b: u32) -> u32 {
    a | b
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefixMatch {
    Disabled,
    Enabled,
}

/// One candidate interpretation of part of the query against one index.
#[derive(Debug, Clone, PartialEq)]
pub struct Phrasematch {
    pub idx: u16,
    pub mask: u32,
    pub weight: f64,
    pub edit_multiplier: f64,
    pub edit_distance: u32,
    pub prefix: PrefixMatch,
    pub scorefactor: f64,
    pub prox_match: bool,
    pub cat_match: bool,
    pub partial_number: bool,
    pub radius: Option<f64>,
    pub zoom: u16,
    pub subquery: Vec<String>,
    pub address: Option<String>,
}

/// All candidates for one index/interpretation, plus the collision and
/// exclusion masks shared by the whole group.
#[derive(Debug, Clone)]
pub struct PhrasematchResult {
    pub idx: u16,
    pub nmask: u32,
    pub bmask: FixedBitSet,
    pub phrasematches: Vec<Phrasematch>,
}

/// An equivalence class of phrasematches with identical stacking behavior.
/// The canonical phrasematch carries the scoring fields (including the
/// low-confidence penalty, when applied); `exemplars` are the originals that
/// get re-emitted on expansion.
#[derive(Debug, Clone)]
pub struct Archetype {
    pub phrasematch: Phrasematch,
    pub exemplars: Vec<Phrasematch>,
}

#[derive(Debug, Clone)]
pub struct ArchetypeResult {
    pub idx: u16,
    pub nmask: u32,
    pub bmask: FixedBitSet,
    pub archetypes: Vec<Archetype>,
}

/// An ordered pick of candidates from distinct indexes. The element with the
/// smallest mask sits at position 0 until the zoom sort reorders for
/// coalesce.
#[derive(Debug, Clone)]
pub struct Stack<T> {
    pub elements: Vec<T>,
    pub relev: f64,
    pub adj_relev: f64,
}

impl<T> Stack<T> {
    pub fn empty() -> Stack<T> {
        Stack { elements: Vec::new(), relev: 0.0, adj_relev: 0.0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpatialmatchOpts {
    pub proximity: Option<[f64; 2]>,
    pub bbox: Option<[f64; 4]>,
    pub allowed_idx: Option<FixedBitSet>,
    pub stackable_limit: Option<usize>,
    pub spatialmatch_stack_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TilePoint {
    pub z: u16,
    pub x: u32,
    pub y: u32,
}

impl TilePoint {
    pub fn at_zoom(&self, z: u16) -> TilePoint {
        if z == self.z {
            *self
        } else if z < self.z {
            let dz = self.z - z;
            TilePoint { z, x: self.x >> dz, y: self.y >> dz }
        } else {
            let dz = z - self.z;
            TilePoint { z, x: self.x << dz, y: self.y << dz }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBounds {
    pub z: u16,
    pub minx: u32,
    pub miny: u32,
    pub maxx: u32,
    pub maxy: u32,
}

impl TileBounds {
    pub fn at_zoom(&self, z: u16) -> TileBounds {
        if z == self.z {
            *self
        } else if z < self.z {
            let dz = self.z - z;
            TileBounds {
                z,
                minx: self.minx >> dz,
                miny: self.miny >> dz,
                maxx: self.maxx >> dz,
                maxy: self.maxy >> dz,
            }
        } else {
            let dz = z - self.z;
            TileBounds {
                z,
                minx: self.minx << dz,
                miny: self.miny << dz,
                maxx: ((self.maxx + 1) << dz) - 1,
                maxy: ((self.maxy + 1) << dz) - 1,
            }
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.minx <= x && x <= self.maxx && self.miny <= y && y <= self.maxy
    }
}

/// One layer of a stack, flattened for the cache boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalesceSubquery {
    pub idx: u16,
    pub zoom: u16,
    pub mask: u32,
    pub weight: f64,
    pub phrase: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoalesceOpts {
    pub centerzxy: Option<TilePoint>,
    pub radius: Option<f64>,
    pub bboxzxy: Option<Vec<TileBounds>>,
}

/// A tile-level cover as returned by the coalesce primitive. `score` and
/// `scoredist` are raw: score is a 3-bit log-scale code, scoredist is either
/// the same code or a proximity-derived float above 7.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheCover {
    pub x: u32,
    pub y: u32,
    pub idx: u16,
    pub id: u32,
    pub tmpid: u32,
    pub relev: f64,
    pub distance: f64,
    pub score: u8,
    pub scoredist: f64,
    pub matches_language: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSpatialmatch {
    pub relev: f64,
    pub covers: Vec<CacheCover>,
}

/// The coalesce primitive: intersects tile covers across the layers of one
/// stack and returns sorted multi-layer matches.
pub trait Coalescer {
    fn coalesce(
        &self,
        stack: &[CoalesceSubquery],
        opts: &CoalesceOpts,
    ) -> Result<Vec<CacheSpatialmatch>, Error>;
}

/// A cache cover enriched with decoded scores and the text/zoom/prefix/mask
/// of the phrasematch layer it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Cover {
    pub x: u32,
    pub y: u32,
    pub relev: f64,
    pub id: u32,
    pub idx: u16,
    pub tmpid: u32,
    pub distance: f64,
    pub score: f64,
    pub scoredist: f64,
    pub matches_language: bool,
    pub prefix: PrefixMatch,
    pub mask: u32,
    pub text: String,
    pub zoom: u16,
}

impl Cover {
    pub fn new(cover: &CacheCover, source: &Phrasematch) -> Cover {
        Cover {
            x: cover.x,
            y: cover.y,
            relev: cover.relev,
            id: cover.id,
            idx: cover.idx,
            tmpid: cover.tmpid,
            distance: cover.distance,
            score: spatial::decode_3bit_log_scale(f64::from(cover.score), source.scorefactor),
            scoredist: spatial::decode_scoredist(cover.scoredist, source.scorefactor),
            matches_language: cover.matches_language,
            prefix: source.prefix,
            mask: source.mask,
            text: source.subquery.join(" "),
            zoom: source.zoom,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Spatialmatch {
    pub relev: f64,
    pub covers: Vec<Cover>,
    pub partial_number: bool,
    pub address: Option<String>,
    pub scoredist: f64,
}

impl Spatialmatch {
    pub fn new(
        cache: &CacheSpatialmatch,
        stack_by_idx: &FxHashMap<u16, &Phrasematch>,
        partial_number: bool,
        address: Option<String>,
    ) -> Result<Spatialmatch, Error> {
        if cache.covers.is_empty() {
            return Err(SpatialmatchError::CoalesceFailure(
                "spatialmatch with no covers".to_string(),
            )
            .into());
        }
        let mut covers = Vec::with_capacity(cache.covers.len());
        for cover in &cache.covers {
            let source = stack_by_idx.get(&cover.idx).ok_or_else(|| {
                SpatialmatchError::CoalesceFailure(format!(
                    "cover references index {} missing from stack",
                    cover.idx
                ))
            })?;
            covers.push(Cover::new(cover, source));
        }
        let boost = if partial_number { PARTIAL_NUMBER_SCOREDIST_BOOST } else { 1.0 };
        let scoredist = covers[0].scoredist * boost;
        Ok(Spatialmatch { relev: cache.relev, covers, partial_number, address, scoredist })
    }
}

#[derive(Debug)]
pub struct SpatialmatchOutput {
    pub results: Vec<Spatialmatch>,
    pub sets: FxHashMap<u32, Cover>,
    pub waste: Vec<Vec<u16>>,
}

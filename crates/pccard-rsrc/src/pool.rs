use crate::error::{Result, RsrcError};

/// A half-open address interval `[start, end)`.
///
/// Public APIs speak `(base, len)` in `u32`; internally everything is `u64`
/// half-open arithmetic so `base + len` cannot wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn from_base_len(base: u32, len: u32) -> Self {
        Self {
            start: base as u64,
            end: base as u64 + len as u64,
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn touches(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn merge(&self, other: &Interval) -> Interval {
        Interval {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Hook into the platform's exclusive-reservation registry.
///
/// `find` records every grant here so that no unrelated host code also claims
/// the same physical range. A `claim` refusal is not an error: the pool simply
/// keeps scanning for a different candidate.
pub trait ReservationRegistry {
    /// Attempts to claim `[base, base+len)` exclusively. Returns `false` when
    /// someone else already holds any part of it.
    fn claim(&mut self, base: u32, len: u32) -> bool;

    /// Releases a claim previously granted by `claim`.
    fn release(&mut self, base: u32, len: u32);
}

/// Registry stub for platforms without an OS-level claim table.
#[derive(Debug, Default)]
pub struct NullRegistry;

impl ReservationRegistry for NullRegistry {
    fn claim(&mut self, _base: u32, _len: u32) -> bool {
        true
    }

    fn release(&mut self, _base: u32, _len: u32) {}
}

/// One resource class worth of free address space.
///
/// Invariants:
/// - `free` and `managed` are ascending and non-overlapping.
/// - Every free interval lies inside some managed interval.
/// - Every live grant is disjoint from `free` and from every other grant.
pub struct ResourcePool {
    /// Currently available intervals.
    free: Vec<Interval>,
    /// Everything ever placed under management (free or granted), used to
    /// reject conflicting `add_range` claims.
    managed: Vec<Interval>,
    /// Live grants, recorded so `release` can validate its argument.
    granted: Vec<Interval>,
    registry: Box<dyn ReservationRegistry + Send>,
    /// Whether `release` merges the returned interval with adjacent free
    /// intervals. The legacy manager never coalesced, which fragments the
    /// pool over long uptimes; keep that behavior reachable for comparison.
    coalesce_on_release: bool,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::with_registry(Box::new(NullRegistry))
    }

    pub fn with_registry(registry: Box<dyn ReservationRegistry + Send>) -> Self {
        Self {
            free: Vec::new(),
            managed: Vec::new(),
            granted: Vec::new(),
            registry,
            coalesce_on_release: true,
        }
    }

    /// Selects the legacy non-coalescing `release` behavior.
    pub fn set_coalesce_on_release(&mut self, coalesce: bool) {
        self.coalesce_on_release = coalesce;
    }

    pub fn free_intervals(&self) -> &[Interval] {
        &self.free
    }

    pub fn granted_intervals(&self) -> &[Interval] {
        &self.granted
    }

    pub fn total_free(&self) -> u64 {
        self.free.iter().map(Interval::len).sum()
    }

    /// Places `[base, base+len)` under management as free space.
    ///
    /// Fails with [`RsrcError::Conflict`] if any part of the span is already
    /// managed; conflicting claims are never merged.
    pub fn add_range(&mut self, base: u32, len: u32) -> Result<()> {
        let iv = checked_interval(base, len)?;
        if self.managed.iter().any(|m| m.overlaps(&iv)) {
            return Err(RsrcError::Conflict { base, len });
        }
        insert_coalescing(&mut self.managed, iv);
        insert_coalescing(&mut self.free, iv);
        Ok(())
    }

    /// Carves `[base, base+len)` out of the pool permanently.
    ///
    /// A span strictly inside one free interval splits it in two. Granted
    /// sub-ranges are unaffected; they leave the pool when released into a
    /// now-unmanaged span (the release is then dropped on the floor).
    pub fn remove_range(&mut self, base: u32, len: u32) -> Result<()> {
        let iv = checked_interval(base, len)?;
        subtract(&mut self.free, iv);
        subtract(&mut self.managed, iv);
        Ok(())
    }

    /// Finds and grants a sub-range of `len` bytes.
    ///
    /// Alignment contract: with `align > 0` the returned base is congruent to
    /// `preferred_base` modulo `align`; with `align == 0` and a non-zero
    /// `preferred_base` the request is for that exact base; otherwise first
    /// fit wins. The grant is recorded in the reservation registry; a registry
    /// refusal just moves the scan along.
    pub fn find(&mut self, preferred_base: u32, len: u32, align: u32) -> Result<u32> {
        if len == 0 {
            return Err(RsrcError::BadArgs("zero-length request"));
        }
        if align != 0 && !align.is_power_of_two() {
            return Err(RsrcError::BadArgs("alignment must be a power of two"));
        }
        if align != 0 && len > align && preferred_base != 0 {
            return Err(RsrcError::BadArgs("length exceeds alignment stride"));
        }

        let want = len as u64;
        let residue = if align != 0 {
            (preferred_base as u64) % (align as u64)
        } else {
            0
        };

        for idx in 0..self.free.len() {
            let iv = self.free[idx];
            let mut candidate = if align != 0 {
                align_up_to_residue(iv.start, align as u64, residue)
            } else if preferred_base != 0 {
                // Exact-base request.
                if (preferred_base as u64) < iv.start {
                    continue;
                }
                preferred_base as u64
            } else {
                iv.start
            };

            while candidate >= iv.start && candidate + want <= iv.end {
                if self.registry.claim(candidate as u32, len) {
                    let grant = Interval::new(candidate, candidate + want);
                    subtract(&mut self.free, grant);
                    insert_sorted(&mut self.granted, grant);
                    return Ok(candidate as u32);
                }
                if align == 0 {
                    // Exact-base or first-fit request: a registry refusal on
                    // the only candidate in this interval means move on.
                    break;
                }
                candidate += align as u64;
            }
        }

        Err(RsrcError::OutOfResource { len, align })
    }

    /// Returns a grant to the pool.
    ///
    /// The `(base, len)` pair must name a live grant exactly. The reservation
    /// registry entry is dropped first; the interval then rejoins the free
    /// list only where it is still managed (a concurrent `remove_range` may
    /// have unmanaged part of it).
    pub fn release(&mut self, base: u32, len: u32) -> Result<()> {
        let iv = checked_interval(base, len)?;
        let pos = self
            .granted
            .iter()
            .position(|g| *g == iv)
            .ok_or(RsrcError::NotGranted { base, len })?;
        self.granted.remove(pos);
        self.registry.release(base, len);

        for piece in clip_to(&self.managed, iv) {
            if self.coalesce_on_release {
                insert_coalescing(&mut self.free, piece);
            } else {
                insert_sorted(&mut self.free, piece);
            }
        }
        Ok(())
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("free", &self.free)
            .field("granted", &self.granted)
            .finish_non_exhaustive()
    }
}

fn checked_interval(base: u32, len: u32) -> Result<Interval> {
    if len == 0 {
        return Err(RsrcError::BadArgs("zero-length range"));
    }
    Ok(Interval::from_base_len(base, len))
}

/// First base `>= at` congruent to `residue` modulo `align`.
fn align_up_to_residue(at: u64, align: u64, residue: u64) -> u64 {
    let rem = at % align;
    if rem <= residue {
        at - rem + residue
    } else {
        at - rem + align + residue
    }
}

fn insert_sorted(list: &mut Vec<Interval>, iv: Interval) {
    if iv.is_empty() {
        return;
    }
    let idx = list.partition_point(|r| r.start < iv.start);
    list.insert(idx, iv);
}

fn insert_coalescing(list: &mut Vec<Interval>, iv: Interval) {
    if iv.is_empty() {
        return;
    }
    let mut new = iv;
    let mut out = Vec::with_capacity(list.len() + 1);
    let mut inserted = false;
    for r in list.drain(..) {
        if r.end < new.start {
            out.push(r);
        } else if new.end < r.start {
            if !inserted {
                out.push(new);
                inserted = true;
            }
            out.push(r);
        } else {
            // Overlapping or adjacent.
            new = new.merge(&r);
        }
    }
    if !inserted {
        out.push(new);
    }
    *list = out;
}

/// Removes `span` from every interval in `list`, splitting as needed.
fn subtract(list: &mut Vec<Interval>, span: Interval) {
    let mut out = Vec::with_capacity(list.len() + 1);
    for r in list.drain(..) {
        if r.end <= span.start || r.start >= span.end {
            out.push(r);
            continue;
        }
        if r.start < span.start {
            out.push(Interval::new(r.start, span.start));
        }
        if r.end > span.end {
            out.push(Interval::new(span.end, r.end));
        }
    }
    *list = out;
}

/// Intersects `iv` with the intervals of `list`.
fn clip_to(list: &[Interval], iv: Interval) -> Vec<Interval> {
    list.iter()
        .filter_map(|m| {
            let piece = Interval::new(iv.start.max(m.start), iv.end.min(m.end));
            (!piece.is_empty()).then_some(piece)
        })
        .collect()
}

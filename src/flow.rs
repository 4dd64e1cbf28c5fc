// flow.rs — Naive sparse optical flow between two corner-response maps.
//
// Greedy local matching, by design not a global optimum: for each local
// maximum of map 1 above the score floor, the window of the same coordinate
// in map 2 is searched and the candidate whose score is closest to the
// source score is accepted, provided the difference is within the relative
// tolerance. Duplicate or crossed matches are possible and intentional —
// this approximates per-feature motion, it does not solve an assignment
// problem.
//
// The mapping is two parallel flat-index arrays (y * width + x), frozen
// once produced.

use crate::image::Image;

/// Matching parameters.
#[derive(Debug, Clone, Copy)]
pub struct FlowConfig {
    /// Absolute score floor: only local maxima of map 1 at or above this
    /// score are matched. The pipeline feeds the corner stage's
    /// per-frame acceptance threshold here.
    pub score_floor: f32,
    /// Relative score tolerance: a candidate with score s2 matches a source
    /// with score s1 when |s2 − s1| <= tolerance · |s1|.
    pub tolerance: f32,
    /// Spatial search window radius in pixels.
    pub radius: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            score_floor: 0.0,
            tolerance: 0.5,
            radius: 5,
        }
    }
}

/// The correspondence mapping: parallel flat pixel indices into frame 1 and
/// frame 2. Never mutated after creation.
#[derive(Debug, Clone, Default)]
pub struct FlowField {
    from: Vec<u32>,
    to: Vec<u32>,
    width: usize,
}

impl FlowField {
    /// Assemble a field from parallel index arrays (the GPU matching stage
    /// reads these back from the device).
    ///
    /// # Panics
    /// Panics if the array lengths differ.
    pub fn from_parts(from: Vec<u32>, to: Vec<u32>, width: usize) -> Self {
        assert_eq!(from.len(), to.len(), "parallel index arrays must have equal length");
        FlowField { from, to, width }
    }

    /// Number of accepted matches.
    #[inline]
    pub fn len(&self) -> usize {
        self.from.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.from.is_empty()
    }

    #[inline]
    pub fn from_indices(&self) -> &[u32] {
        &self.from
    }

    #[inline]
    pub fn to_indices(&self) -> &[u32] {
        &self.to
    }

    /// Iterate matches as ((x1, y1), (x2, y2)) pixel coordinates.
    pub fn pairs(&self) -> impl Iterator<Item = ((usize, usize), (usize, usize))> + '_ {
        let w = self.width;
        self.from.iter().zip(self.to.iter()).map(move |(&a, &b)| {
            (
                (a as usize % w, a as usize / w),
                (b as usize % w, b as usize / w),
            )
        })
    }

    /// Average motion vector over matches with nonzero displacement, or
    /// `None` when every accepted match is stationary. Consumed by the
    /// visualization collaborator for the averaged motion arrow.
    pub fn average_motion(&self) -> Option<(f32, f32)> {
        let mut sum = (0.0f32, 0.0f32);
        let mut moving = 0usize;
        for ((x1, y1), (x2, y2)) in self.pairs() {
            if x1 != x2 || y1 != y2 {
                sum.0 += x2 as f32 - x1 as f32;
                sum.1 += y2 as f32 - y1 as f32;
                moving += 1;
            }
        }
        if moving == 0 {
            return None;
        }
        Some((sum.0 / moving as f32, sum.1 / moving as f32))
    }
}

/// Find local maxima of a response map: pixels at or above `floor`, with
/// positive score, not below any in-bounds 8-neighbor.
pub fn local_maxima(map: &Image<f32>, floor: f32) -> Vec<(usize, usize)> {
    let w = map.width();
    let h = map.height();
    let mut maxima = Vec::new();

    for y in 0..h {
        for x in 0..w {
            let m = map.get(x, y);
            if m < floor || m <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'scan: for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    if (nx, ny) != (x, y) && map.get(nx, ny) > m {
                        is_max = false;
                        break 'scan;
                    }
                }
            }
            if is_max {
                maxima.push((x, y));
            }
        }
    }
    maxima
}

/// Greedy correspondence matching between two response maps of identical
/// dimensions.
///
/// For each local maximum of `map1`, the best in-window candidate of `map2`
/// (smallest score difference, ties broken toward the smallest
/// displacement) is accepted when within the relative tolerance. On two
/// identical maps this yields the identity mapping.
///
/// # Panics
/// Panics if the map dimensions differ.
pub fn match_features(map1: &Image<f32>, map2: &Image<f32>, cfg: &FlowConfig) -> FlowField {
    assert_eq!(map1.width(), map2.width(), "response map dimensions must match");
    assert_eq!(map1.height(), map2.height(), "response map dimensions must match");

    let w = map1.width();
    let h = map1.height();
    let r = cfg.radius as isize;

    let mut from = Vec::new();
    let mut to = Vec::new();

    for (x, y) in local_maxima(map1, cfg.score_floor) {
        let s1 = map1.get(x, y);
        let budget = cfg.tolerance * s1.abs();

        // Best candidate: smallest score difference, then smallest
        // displacement.
        let mut best: Option<(f32, isize, usize, usize)> = None;
        for dy in -r..=r {
            for dx in -r..=r {
                let cx = x as isize + dx;
                let cy = y as isize + dy;
                if cx < 0 || cy < 0 || cx >= w as isize || cy >= h as isize {
                    continue;
                }
                let s2 = map2.get(cx as usize, cy as usize);
                let diff = (s2 - s1).abs();
                if diff > budget {
                    continue;
                }
                let dist = dx * dx + dy * dy;
                let better = match best {
                    None => true,
                    Some((bd, bdist, _, _)) => {
                        diff < bd || (diff == bd && dist < bdist)
                    }
                };
                if better {
                    best = Some((diff, dist, cx as usize, cy as usize));
                }
            }
        }

        if let Some((_, _, cx, cy)) = best {
            from.push(map1.flat_index(x, y) as u32);
            to.push(map2.flat_index(cx, cy) as u32);
        }
    }

    FlowField { from, to, width: w }
}

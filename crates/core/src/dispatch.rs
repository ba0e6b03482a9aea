//! Tile scheduling.
//!
//! Keeps the set of grid cells that still need work and hands them out one at
//! a time, in queue order, at random, or nearest to a focus point. Every cell
//! moves `Remaining -> Taken -> Submitted`; a taken cell can be cancelled back
//! to the front of the queue.

use std::collections::VecDeque;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::RenderError;
use crate::geometry::TileGeometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileCoord {
    pub row: u32,
    pub col: u32,
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Remaining,
    Taken,
    Submitted,
}

#[derive(Debug)]
pub struct TileDispatcher {
    cols: u32,
    states: Vec<TileState>,
    queue: VecDeque<TileCoord>,
    centers: Vec<(f64, f64)>,
    in_flight: usize,
    submitted: usize,
    rng: StdRng,
}

impl TileDispatcher {
    pub fn new(geometry: &TileGeometry) -> Self {
        Self::with_rng(geometry, StdRng::from_entropy())
    }

    /// Deterministic random picks for reproducible runs.
    pub fn with_seed(geometry: &TileGeometry, seed: u64) -> Self {
        Self::with_rng(geometry, StdRng::seed_from_u64(seed))
    }

    fn with_rng(geometry: &TileGeometry, rng: StdRng) -> Self {
        let queue: VecDeque<TileCoord> = geometry.coords().collect();
        let centers = queue.iter().map(|c| geometry.tile_center(*c)).collect();
        Self {
            cols: geometry.cols,
            states: vec![TileState::Remaining; queue.len()],
            queue,
            centers,
            in_flight: 0,
            submitted: 0,
            rng,
        }
    }

    pub fn total(&self) -> usize {
        self.states.len()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn is_finished(&self) -> bool {
        self.submitted == self.total()
    }

    pub fn state(&self, coord: TileCoord) -> Option<TileState> {
        self.index(coord).map(|i| self.states[i])
    }

    pub fn take_next(&mut self) -> Option<TileCoord> {
        let coord = self.queue.pop_front()?;
        self.mark_taken(coord);
        Some(coord)
    }

    pub fn take_random(&mut self) -> Option<TileCoord> {
        if self.queue.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..self.queue.len());
        let coord = self.queue.remove(pick)?;
        self.mark_taken(coord);
        Some(coord)
    }

    /// Take the remaining tile whose centre is closest to `focus`.
    ///
    /// `focus` is in output-image pixels and is mapped back to input space by
    /// dividing by `scale`. Ties keep the earliest tile in queue order.
    pub fn take_nearest(&mut self, focus: (f64, f64), scale: u32) -> Option<TileCoord> {
        let scale = scale.max(1) as f64;
        let target = (focus.0 / scale, focus.1 / scale);

        let mut best: Option<(usize, f64)> = None;
        for (pos, coord) in self.queue.iter().enumerate() {
            let Some(i) = self.index(*coord) else {
                continue;
            };
            let (cx, cy) = self.centers[i];
            let dist = (cx - target.0).powi(2) + (cy - target.1).powi(2);
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((pos, dist));
            }
        }

        let (pos, _) = best?;
        let coord = self.queue.remove(pos)?;
        self.mark_taken(coord);
        Some(coord)
    }

    /// Return a taken tile to the front of the queue.
    pub fn cancel(&mut self, coord: TileCoord) -> Result<(), RenderError> {
        let i = self.expect_state(coord, TileState::Taken, "cancelled")?;
        self.states[i] = TileState::Remaining;
        self.in_flight -= 1;
        self.queue.push_front(coord);
        Ok(())
    }

    /// Return every in-flight tile and restore row-major order over all
    /// cells that were never submitted.
    pub fn cancel_all(&mut self) -> Vec<TileCoord> {
        let mut returned = Vec::with_capacity(self.in_flight);
        self.queue.clear();
        for (i, state) in self.states.iter_mut().enumerate() {
            let coord = TileCoord {
                row: i as u32 / self.cols,
                col: i as u32 % self.cols,
            };
            match state {
                TileState::Taken => {
                    *state = TileState::Remaining;
                    returned.push(coord);
                    self.queue.push_back(coord);
                }
                TileState::Remaining => self.queue.push_back(coord),
                TileState::Submitted => {}
            }
        }
        self.in_flight = 0;
        returned
    }

    pub fn submit(&mut self, coord: TileCoord) -> Result<(), RenderError> {
        let i = self.expect_state(coord, TileState::Taken, "submitted")?;
        self.states[i] = TileState::Submitted;
        self.in_flight -= 1;
        self.submitted += 1;
        Ok(())
    }

    fn mark_taken(&mut self, coord: TileCoord) {
        if let Some(i) = self.index(coord) {
            self.states[i] = TileState::Taken;
            self.in_flight += 1;
        }
    }

    fn expect_state(
        &self,
        coord: TileCoord,
        expected: TileState,
        action: &'static str,
    ) -> Result<usize, RenderError> {
        let i = self
            .index(coord)
            .ok_or_else(|| RenderError::config(format!("tile {coord} is outside the grid")))?;
        let state = self.states[i];
        if state != expected {
            return Err(RenderError::TileState {
                coord,
                state,
                action,
            });
        }
        Ok(i)
    }

    fn index(&self, coord: TileCoord) -> Option<usize> {
        if coord.col >= self.cols {
            return None;
        }
        let i = coord.row as usize * self.cols as usize + coord.col as usize;
        (i < self.states.len()).then_some(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryParams;

    fn grid(w: u32, h: u32) -> TileGeometry {
        TileGeometry::compute(&GeometryParams {
            input_width: w,
            input_height: h,
            scale: 2,
            offset: 16,
            tile_size: 64,
            blend_size: 16,
        })
        .unwrap()
    }

    fn coord(row: u32, col: u32) -> TileCoord {
        TileCoord { row, col }
    }

    #[test]
    fn test_take_next_is_row_major() {
        let g = grid(100, 100);
        let mut d = TileDispatcher::with_seed(&g, 1);
        assert_eq!(d.total(), 9);

        let order: Vec<_> = std::iter::from_fn(|| d.take_next()).collect();
        assert_eq!(order.len(), 9);
        assert_eq!(order[0], coord(0, 0));
        assert_eq!(order[1], coord(0, 1));
        assert_eq!(order[3], coord(1, 0));
        assert_eq!(d.remaining(), 0);
        assert_eq!(d.in_flight(), 9);
    }

    #[test]
    fn test_cancel_returns_tile_to_front() {
        let g = grid(100, 100);
        let mut d = TileDispatcher::with_seed(&g, 1);
        d.take_next().unwrap();
        let second = d.take_next().unwrap();

        d.cancel(second).unwrap();
        assert_eq!(d.in_flight(), 1);
        assert_eq!(d.take_next(), Some(second));
    }

    #[test]
    fn test_double_submit_is_rejected() {
        let g = grid(100, 100);
        let mut d = TileDispatcher::with_seed(&g, 1);
        let c = d.take_next().unwrap();
        d.submit(c).unwrap();

        let err = d.submit(c).unwrap_err();
        assert!(matches!(
            err,
            RenderError::TileState {
                state: TileState::Submitted,
                ..
            }
        ));
        assert_eq!(d.submitted(), 1);
    }

    #[test]
    fn test_submit_never_taken_is_rejected() {
        let g = grid(100, 100);
        let mut d = TileDispatcher::with_seed(&g, 1);
        assert!(d.submit(coord(2, 2)).is_err());
        assert!(d.cancel(coord(2, 2)).is_err());
        assert!(d.submit(coord(7, 0)).unwrap_err().is_configuration());
    }

    #[test]
    fn test_cancel_all_restores_unsubmitted_in_row_major_order() {
        let g = grid(100, 100);
        let mut d = TileDispatcher::with_seed(&g, 7);

        let a = d.take_random().unwrap();
        d.submit(a).unwrap();
        let b = d.take_random().unwrap();
        let c = d.take_random().unwrap();

        let mut returned = d.cancel_all();
        returned.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(returned, expected);
        assert_eq!(d.in_flight(), 0);
        assert_eq!(d.remaining(), 8);

        let order: Vec<_> = std::iter::from_fn(|| d.take_next()).collect();
        let expected: Vec<_> = g.coords().filter(|c| *c != a).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_take_random_visits_every_tile_once() {
        let g = grid(300, 200);
        let mut d = TileDispatcher::with_seed(&g, 42);
        let mut seen = Vec::new();
        while let Some(c) = d.take_random() {
            d.submit(c).unwrap();
            seen.push(c);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), g.tile_count());
        assert!(d.is_finished());
    }

    #[test]
    fn test_take_nearest_picks_closest_center() {
        let g = grid(100, 100);
        let mut d = TileDispatcher::with_seed(&g, 1);

        // bottom-right corner of the 200x200 output
        assert_eq!(d.take_nearest((199.0, 199.0), 2), Some(coord(2, 2)));
        // centre tile center is (64, 64) in input space
        assert_eq!(d.take_nearest((128.0, 128.0), 2), Some(coord(1, 1)));
        // far outside the image the corner tile wins
        assert_eq!(d.take_nearest((-1000.0, -1000.0), 2), Some(coord(0, 0)));
    }
}

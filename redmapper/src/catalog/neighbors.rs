//! Angular neighbour queries on the unit sphere.
//!
//! Positions are stored as 3-D unit vectors in an immutable k-d tree; an
//! angular radius θ maps to the chord length `2 sin(θ/2)`, so sphere queries
//! become Euclidean ball queries.

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;

type Tree = ImmutableKdTree<f64, u32, 3, 32>;

/// A galaxy index with its angular distance from the query point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub dist_deg: f64,
}

pub(crate) fn unit_vector(ra_deg: f64, dec_deg: f64) -> [f64; 3] {
    let (ra, dec) = (ra_deg.to_radians(), dec_deg.to_radians());
    [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()]
}

fn chord_to_deg(chord: f64) -> f64 {
    (2.0 * (0.5 * chord).min(1.0).asin()).to_degrees()
}

/// Great-circle separation in degrees.
pub fn angular_separation_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let a = unit_vector(ra1, dec1);
    let b = unit_vector(ra2, dec2);
    let chord2: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    chord_to_deg(chord2.sqrt())
}

pub struct SkyTree {
    // kiddo cannot build an empty immutable tree
    tree: Option<Tree>,
}

impl SkyTree {
    pub fn new(positions: &[(f64, f64)]) -> Self {
        if positions.is_empty() {
            return Self { tree: None };
        }
        let points: Vec<[f64; 3]> = positions
            .iter()
            .map(|&(ra, dec)| unit_vector(ra, dec))
            .collect();
        Self {
            tree: Some(ImmutableKdTree::new_from_slice(&points)),
        }
    }

    /// Everything within `radius_deg`, sorted by distance then index.
    pub fn within(&self, ra: f64, dec: f64, radius_deg: f64) -> Vec<Neighbor> {
        let Some(tree) = &self.tree else {
            return Vec::new();
        };
        let chord = 2.0 * (0.5 * radius_deg.to_radians()).sin();
        let query = unit_vector(ra, dec);
        let mut found: Vec<Neighbor> = tree
            .within::<SquaredEuclidean>(&query, chord * chord)
            .into_iter()
            .map(|nn| Neighbor {
                index: nn.item as usize,
                dist_deg: chord_to_deg(nn.distance.sqrt()),
            })
            .collect();
        found.sort_by(|a, b| {
            a.dist_deg
                .total_cmp(&b.dist_deg)
                .then(a.index.cmp(&b.index))
        });
        found
    }
}

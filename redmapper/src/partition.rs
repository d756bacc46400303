//! Healpix sky partitions and the parallel partition runner.
//!
//! Each partition holds the galaxies whose position hashes to its pixel plus
//! a read-only halo of neighbouring galaxies within `border` degrees, so
//! clusters near a pixel edge see their full aperture. A cluster belongs to
//! the partition whose pixel contains its final center; every other
//! partition drops it. Partition results are merged in pixel order.

use indicatif::ProgressBar;
use rayon::prelude::*;
use std::collections::BTreeMap;

use crate::catalog::GalaxyCatalog;
use crate::cluster::Cluster;
use crate::context::RunContext;
use crate::error::Result;
use crate::finder::{ClusterFinder, DiscardCounts, FinderOutput};
use crate::mask::healpix_hash;

/// Offsets, in units of the border width, sampled to find halo pixels.
const HALO_DIRECTIONS: [(f64, f64); 8] = [
    (1.0, 0.0),
    (-1.0, 0.0),
    (0.0, 1.0),
    (0.0, -1.0),
    (1.0, 1.0),
    (1.0, -1.0),
    (-1.0, 1.0),
    (-1.0, -1.0),
];

/// Catalog indices of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub pixel: u64,
    /// Galaxies hashing to `pixel`
    pub core: Vec<usize>,
    /// Galaxies of neighbouring pixels within the border
    pub halo: Vec<usize>,
}

impl Partition {
    /// Core and halo indices, ascending.
    pub fn working_set(&self) -> Vec<usize> {
        let mut all: Vec<usize> = self.core.iter().chain(self.halo.iter()).copied().collect();
        all.sort_unstable();
        all.dedup();
        all
    }
}

/// Split a catalog into healpix partitions at `depth`, ordered by pixel.
///
/// Partitions without core galaxies are never created, so a halo alone
/// never produces work.
pub fn partition_catalog(catalog: &GalaxyCatalog, depth: u8, border: f64) -> Vec<Partition> {
    let mut partitions: BTreeMap<u64, Partition> = BTreeMap::new();
    let pixels: Vec<u64> = catalog
        .galaxies()
        .iter()
        .map(|g| healpix_hash(depth, g.ra, g.dec))
        .collect();
    for (index, &pixel) in pixels.iter().enumerate() {
        partitions
            .entry(pixel)
            .or_insert_with(|| Partition {
                pixel,
                ..Partition::default()
            })
            .core
            .push(index);
    }

    if border > 0.0 {
        for (index, galaxy) in catalog.galaxies().iter().enumerate() {
            let cos_dec = galaxy.dec.to_radians().cos().max(1e-6);
            let mut seen: Vec<u64> = Vec::new();
            for (dx, dy) in HALO_DIRECTIONS {
                let ra = galaxy.ra + dx * border / cos_dec;
                let dec = (galaxy.dec + dy * border).clamp(-90.0, 90.0);
                let pixel = healpix_hash(depth, ra, dec);
                if pixel == pixels[index] || seen.contains(&pixel) {
                    continue;
                }
                seen.push(pixel);
                if let Some(partition) = partitions.get_mut(&pixel) {
                    partition.halo.push(index);
                }
            }
        }
    }

    partitions.into_values().collect()
}

/// Run the finder over one partition and keep the clusters it owns.
fn run_partition(
    ctx: &RunContext,
    catalog: &GalaxyCatalog,
    partition: &Partition,
    depth: u8,
) -> Result<FinderOutput> {
    let sub = catalog.subset(&partition.working_set())?;
    let output = ClusterFinder::new(ctx, &sub).run();
    let total = output.clusters.len();
    let clusters: Vec<Cluster> = output
        .clusters
        .into_iter()
        .filter(|c| healpix_hash(depth, c.ra, c.dec) == partition.pixel)
        .collect();
    log::info!(
        "Partition {}: {} core + {} halo galaxies, {} clusters ({} owned elsewhere)",
        partition.pixel,
        partition.core.len(),
        partition.halo.len(),
        clusters.len(),
        total - clusters.len()
    );
    Ok(FinderOutput {
        clusters,
        discards: output.discards,
    })
}

/// Find clusters in every partition using a pool of `nproc` threads.
///
/// Partitions run independently; percolation inside each stays sequential.
/// The merged clusters are renumbered from 1 in pixel order.
///
/// # Errors
///
/// Any partition failure aborts the run.
pub fn find_clusters(
    ctx: &RunContext,
    catalog: &GalaxyCatalog,
    nproc: usize,
    border: f64,
    progress: Option<&ProgressBar>,
) -> Result<FinderOutput> {
    let depth = ctx.config.partition_depth;
    let partitions = partition_catalog(catalog, depth, border);
    log::info!(
        "Running {} partitions at depth {depth} on {} threads (border {border} deg)",
        partitions.len(),
        nproc.max(1)
    );
    if let Some(pb) = progress {
        pb.set_length(partitions.len() as u64);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(nproc.max(1))
        .build()?;
    let results: Vec<Result<FinderOutput>> = pool.install(|| {
        partitions
            .par_iter()
            .map(|partition| {
                let result = run_partition(ctx, catalog, partition, depth);
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                result
            })
            .collect()
    });

    let mut merged = FinderOutput::default();
    for result in results {
        let output = result?;
        merged.clusters.extend(output.clusters);
        merged.discards = merged.discards.merged(&output.discards);
    }
    for (i, cluster) in merged.clusters.iter_mut().enumerate() {
        cluster.id = i as u64 + 1;
    }
    log::info!(
        "Found {} clusters, discarded {} candidates",
        merged.clusters.len(),
        merged.discards.total()
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{default_template, galaxy_on_sequence};

    fn grid_catalog(n: usize, spacing: f64) -> GalaxyCatalog {
        let model = default_template([0.05, 0.6]).unwrap();
        let galaxies = (0..n * n)
            .map(|i| {
                let ra = 40.0 + spacing * (i % n) as f64;
                let dec = -5.0 + spacing * (i / n) as f64;
                galaxy_on_sequence(&model, i as u64, 0.3, 19.0, ra, dec)
            })
            .collect();
        GalaxyCatalog::new(galaxies, 4, 3).unwrap()
    }

    #[test]
    fn test_partitions_cover_every_galaxy_once() {
        let catalog = grid_catalog(20, 0.5);
        let partitions = partition_catalog(&catalog, 3, 0.0);
        assert!(partitions.len() > 1);
        let mut cores: Vec<usize> = partitions.iter().flat_map(|p| p.core.clone()).collect();
        cores.sort_unstable();
        assert_eq!(cores, (0..400).collect::<Vec<_>>());
        assert!(partitions.iter().all(|p| p.halo.is_empty()));
        let pixels: Vec<u64> = partitions.iter().map(|p| p.pixel).collect();
        let mut sorted = pixels.clone();
        sorted.sort_unstable();
        assert_eq!(pixels, sorted);
    }

    #[test]
    fn test_halo_holds_only_foreign_galaxies() {
        let catalog = grid_catalog(20, 0.5);
        let partitions = partition_catalog(&catalog, 3, 1.0);
        assert!(partitions.iter().any(|p| !p.halo.is_empty()));
        for p in &partitions {
            for &i in &p.halo {
                assert!(!p.core.contains(&i));
                let g = catalog.get(i);
                assert_ne!(healpix_hash(3, g.ra, g.dec), p.pixel);
            }
            let ws = p.working_set();
            assert_eq!(ws.len(), p.core.len() + p.halo.len());
        }
    }

    #[test]
    fn test_discard_counts_merge() {
        let a = DiscardCounts {
            below_min_lambda: 2,
            mask_coverage: 1,
            seed_claimed: 0,
        };
        let b = DiscardCounts {
            below_min_lambda: 1,
            mask_coverage: 0,
            seed_claimed: 4,
        };
        let m = a.merged(&b);
        assert_eq!(m.total(), 8);
        assert_eq!(m.seed_claimed, 4);
    }
}

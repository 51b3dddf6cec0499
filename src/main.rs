//! Streaming demo: a virtual camera wanders over synthetic hierarchies while
//! one context keeps its cuts up to date.
//!
//! Usage: cargo run --release -- [OPTIONS]
//!
//! Options:
//!   --manifest <PATH>  Dataset manifest (JSON); default: synthetic dataset
//!   --out <DIR>        Where the synthetic dataset is written
//!   --frames <N>       Frames to simulate (default: 300)
//!   --depth <D>        Depth of the synthetic hierarchies (default: 6)
//!   --node-size <B>    Bytes per node of the synthetic dataset (default: 4096)
//!   --pool-mb <MB>     Slot pool size for the synthetic dataset (default: 8)
//!   --threads <N>      Loader threads (default: 4)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lodstream::core::types::{CutKey, NodeId, NodeKey, Priority, ViewId};
use lodstream::core::{DatasetManifest, Result, StreamingConfig, logging};
use lodstream::cut::{CutDatabase, CutUpdateThread, CutUpdater, LodDecision, LodMetric};
use lodstream::streaming::{
    Catalog, FileReaderFactory, Resource, ResourceDesc, StreamingCache, write_nodes,
};

const CONTEXT: u32 = 0;
const VIEW: ViewId = 0;
const FRAME_TIME: Duration = Duration::from_millis(16);

/// Refines towards a focus leaf and coarsens everywhere else
struct FocusMetric {
    catalog: Catalog,
    focus: AtomicU64,
}

impl FocusMetric {
    fn on_focus_path(resource: &Resource, node: NodeId, focus: NodeId) -> bool {
        let mut cursor = Some(focus % resource.node_count());
        while let Some(id) = cursor {
            if id == node {
                return true;
            }
            cursor = resource.parent(id);
        }
        false
    }
}

impl LodMetric for FocusMetric {
    fn decide(&self, _view: ViewId, key: NodeKey) -> LodDecision {
        let Ok(resource) = self.catalog.get(key.resource) else {
            return LodDecision::Keep;
        };
        let depth = resource.depth_of(key.node);
        if Self::on_focus_path(resource, key.node, self.focus.load(Ordering::Relaxed)) {
            LodDecision::Split {
                priority: 100 - depth as Priority,
            }
        } else if depth > 1 {
            LodDecision::Collapse
        } else {
            LodDecision::Keep
        }
    }
}

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let frames = parse_usize_arg(args, "--frames").unwrap_or(300);

    let manifest = match parse_str_arg(args, "--manifest") {
        Some(path) => DatasetManifest::load_sync(Path::new(&path))?,
        None => {
            let out = parse_str_arg(args, "--out")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("lodstream-demo"));
            synthetic_dataset(
                &out,
                parse_u32_arg(args, "--depth").unwrap_or(6),
                parse_usize_arg(args, "--node-size").unwrap_or(4096),
                parse_usize_arg(args, "--pool-mb").unwrap_or(8),
                parse_usize_arg(args, "--threads").unwrap_or(4),
            )?
        }
    };

    let catalog = Catalog::from_descs(manifest.resources.iter().cloned())?;
    let metric = Arc::new(FocusMetric {
        catalog: catalog.clone(),
        focus: AtomicU64::new(0),
    });
    let resource_ids: Vec<u32> = catalog.resources().map(Resource::id).collect();

    let cache = Arc::new(StreamingCache::new(
        manifest.config,
        catalog,
        Arc::new(FileReaderFactory),
    )?);
    let cuts = Arc::new(CutDatabase::new());
    for &resource in &resource_ids {
        cuts.cut(CutKey::new(CONTEXT, VIEW, resource));
    }

    let updater = CutUpdater::new(CONTEXT, Arc::clone(&cache), Arc::clone(&cuts));
    let mut update_thread = CutUpdateThread::spawn(updater, metric.clone())?;

    let start = Instant::now();
    let mut rng: u64 = 0x2545_f491_4f6c_dd1d;
    let mut drawn_total = 0usize;
    let mut mismatches = 0usize;

    for frame in 0..frames {
        // Move the camera every second
        if frame % 60 == 0 {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            metric.focus.store(rng, Ordering::Relaxed);
            log::info!("Frame {}: camera focus moved", frame);
        }

        update_thread.dispatch();

        // "Render": draw every node of every published cut
        for &resource in &resource_ids {
            let key = CutKey::new(CONTEXT, VIEW, resource);
            let Some(cut) = cuts.current_cut(key) else {
                continue;
            };
            for (node, _slot) in cut.drawable() {
                let Some(bytes) = cache.data(NodeKey::new(resource, node)) else {
                    continue;
                };
                // Manifest datasets may use nodes too small to carry a stamp
                if stamp_of(&bytes).is_some_and(|stamped| stamped != node) {
                    mismatches += 1;
                }
                drawn_total += 1;
            }
        }

        std::thread::sleep(FRAME_TIME);
    }

    update_thread.wait_for_cycles(1, Duration::from_secs(1));
    if let Some(mut updater) = update_thread.stop() {
        updater.reset();
    }

    let stats = cache.loader_stats();
    log::info!(
        "{} frames in {:.1}s: {} nodes drawn, {} payload mismatches",
        frames,
        start.elapsed().as_secs_f32(),
        drawn_total,
        mismatches
    );
    log::info!(
        "Loaded {} nodes ({} KB), {} failures, {} backpressure waits",
        stats.nodes_loaded,
        stats.bytes_loaded / 1024,
        stats.failures,
        stats.backpressure_waits
    );
    log::info!(
        "Slot pool: {:.1}% occupied, {} still queued",
        cache.slot_pool().utilization(),
        cache.num_pending()
    );

    cache.shutdown();
    Ok(())
}

/// Write one geometry octree and one texture quadtree whose node payloads
/// start with their node id
fn synthetic_dataset(
    out: &Path,
    depth: u32,
    node_size: usize,
    pool_mb: usize,
    threads: usize,
) -> Result<DatasetManifest> {
    // Payloads start with the 8-byte node id
    let node_size = node_size.max(8);
    let resources = vec![
        ResourceDesc::geometry(out.join("geometry.lod"), 8, depth.saturating_sub(2), node_size),
        ResourceDesc::texture(out.join("texture.tiles"), depth, node_size),
    ];

    let catalog = Catalog::from_descs(resources.iter().cloned())?;
    for resource in catalog.resources() {
        log::info!("Writing {} nodes to {:?}", resource.node_count(), resource.desc().path);
        write_nodes(&resource.desc().path, resource, |node, buf| {
            buf.fill(resource.id() as u8);
            buf[..8].copy_from_slice(&node.to_le_bytes());
        })?;
    }

    Ok(DatasetManifest {
        config: StreamingConfig {
            slot_pool_bytes: pool_mb * 1024 * 1024,
            loader_threads: threads,
            ..Default::default()
        },
        resources,
    })
}

/// Node id stamped at the start of a synthetic payload
fn stamp_of(bytes: &[u8]) -> Option<u64> {
    bytes.get(..8).map(bytemuck::pod_read_unaligned::<u64>)
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_of_reads_node_id() {
        let mut payload = vec![0xAAu8; 16];
        payload[..8].copy_from_slice(&42u64.to_le_bytes());
        assert_eq!(stamp_of(&payload), Some(42));
    }

    #[test]
    fn test_stamp_of_short_node() {
        assert_eq!(stamp_of(&[1, 2, 3, 4]), None);
        assert_eq!(stamp_of(&[]), None);
    }
}

//! Test fixtures: workspace builders and generated event clouds.

use std::path::PathBuf;

use ctor::ctor;
use mdbox::{Dimension, MdConfig, MdEvent, MdWorkspace};
use rand::Rng;
use tempfile::TempDir;

#[ctor]
fn init_logging() {
    colog::init();
}

/// A workspace bound to a temp directory that lives as long as the test.
pub struct TestWorkspace {
    pub ws: MdWorkspace,
    pub path: PathBuf,
    // Held so the backing file outlives the workspace handle.
    _dir: TempDir,
}

/// Builds a 2-D workspace over `[0,10] x [0,10]`.
pub fn workspace_2d(config: MdConfig) -> TestWorkspace {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("workspace.mdbox");
    let ws = MdWorkspace::create(&path, dims_2d(), config).expect("create workspace");
    TestWorkspace {
        ws,
        path,
        _dir: dir,
    }
}

pub fn dims_2d() -> Vec<Dimension> {
    vec![
        Dimension::new("Qx", "qx", "A^-1", 0.0, 10.0, 100).expect("dimension"),
        Dimension::new("Qy", "qy", "A^-1", 0.0, 10.0, 100).expect("dimension"),
    ]
}

/// `n` events uniform over the 2-D extent, unit signal and error.
pub fn uniform_events_2d(n: usize) -> Vec<MdEvent> {
    let mut rng = rand::rng();
    (0..n)
        .map(|_| {
            MdEvent::new(
                vec![rng.random_range(0.0..10.0), rng.random_range(0.0..10.0)],
                1.0,
                1.0,
            )
        })
        .collect()
}

/// Deterministic grid of events, one per call, cycling over cell centers.
pub fn grid_events_2d(n: usize) -> Vec<MdEvent> {
    (0..n)
        .map(|i| {
            MdEvent::new(
                vec![(i % 10) as f64 + 0.5, ((i / 10) % 10) as f64 + 0.5],
                1.0,
                1.0,
            )
        })
        .collect()
}

//! End-to-end scenarios for the count hierarchy.

use std::sync::Arc;

use cloudtree::{
    Bounds, Hierarchy, MemoryEndpoint, Point3, PointState, Structure, StructureConfig,
};
use serde_json::json;

fn quad_structure(base_depth: u64) -> Structure {
    Structure::new(StructureConfig {
        base_depth,
        dimensions: 2,
        points_per_chunk: 8,
        ..Default::default()
    })
    .expect("valid structure")
}

fn square(extent: f64) -> Bounds {
    Bounds::new(Point3::flat(0.0, 0.0), Point3::flat(extent, extent))
}

/// Four points in the south-west quadrant, queried at three depths.
#[test]
fn query_counts_unit_square() {
    let structure = quad_structure(4);
    let bounds = square(4.0);
    let hierarchy = Hierarchy::new(structure, bounds).expect("hierarchy");

    for (x, y) in [(1.0, 1.0), (1.0, 2.0), (2.0, 1.0), (2.0, 2.0)] {
        hierarchy.track(&Point3::flat(x, y), 3).expect("track");
    }

    let out = hierarchy.query(&bounds, 0, 3).expect("query");
    assert_eq!(
        out,
        json!({
            "n": 4,
            "sw": {
                "n": 4,
                "sw": {"n": 1},
                "se": {"n": 1},
                "nw": {"n": 1},
                "ne": {"n": 1},
            },
        })
    );
}

/// With an unbounded depth range, the root count equals the total
/// points ingested inside the query box.
#[test]
fn root_count_is_total_ingested() {
    let structure = quad_structure(3);
    let bounds = square(8.0);
    let hierarchy = Hierarchy::new(structure, bounds).expect("hierarchy");

    for i in 0..37 {
        let p = Point3::flat(0.2 + (i % 6) as f64, 0.3 + (i / 6) as f64);
        hierarchy.track(&p, 5).expect("track");
    }

    let out = hierarchy.query(&bounds, 0, u64::MAX).expect("query");
    assert_eq!(out["n"], json!(37));
}

/// Save to an in-memory endpoint, reconstruct, and compare the query
/// responses byte for byte.
#[test]
fn saved_and_reloaded_queries_agree() {
    let structure = quad_structure(3);
    let bounds = square(4.0);
    let endpoint = Arc::new(MemoryEndpoint::new());

    let hierarchy = Hierarchy::new(structure.clone(), bounds).expect("hierarchy");
    for (x, y) in [(0.5, 0.5), (3.5, 0.5), (1.5, 2.5), (0.5, 0.6), (2.1, 2.1)] {
        hierarchy.track(&Point3::flat(x, y), 5).expect("track");
    }
    hierarchy.save(endpoint.as_ref(), "").expect("save");

    let before = hierarchy.query(&bounds, 0, 5).expect("query");

    let restored = Hierarchy::load(structure, bounds, endpoint, "").expect("load");
    let after = restored.query(&bounds, 0, 5).expect("query");

    assert_eq!(before.to_string(), after.to_string());
}

/// A depth-banded query roots its response at the first emitted depth:
/// no counts appear above `depth_begin`.
#[test]
fn depth_banded_query_roots_at_depth_begin() {
    let structure = quad_structure(6);
    let bounds = square(8.0);
    let hierarchy = Hierarchy::new(structure, bounds).expect("hierarchy");

    // Three points inside one depth-3 cell ([0,1]^2), one far away.
    for (x, y) in [(0.2, 0.2), (0.8, 0.3), (0.4, 0.9)] {
        hierarchy.track(&Point3::flat(x, y), 4).expect("track");
    }
    hierarchy.track(&Point3::flat(7.5, 7.5), 4).expect("track");

    let qbox = Bounds::new(Point3::flat(0.1, 0.1), Point3::flat(0.9, 0.9));
    let out = hierarchy.query(&qbox, 3, 5).expect("query");

    assert_eq!(out["n"], json!(3));
    // Children are the depth-4 subdivision of that single cell; every
    // key is a direction token or "n".
    for key in out.as_object().expect("object").keys() {
        assert!(matches!(key.as_str(), "n" | "sw" | "se" | "nw" | "ne"));
    }
}

/// In tubular mode the tree splits only in (x, y); points stacked at
/// the same plan position land in the same spatial cells and their
/// ticks fold together in the query response.
#[test]
fn tubular_ticks_fold_into_plan_cells() {
    let structure = Structure::new(StructureConfig {
        base_depth: 3,
        dimensions: 2,
        tubular: true,
        ..Default::default()
    })
    .expect("structure");
    let bounds = Bounds::new(Point3::new(0.0, 0.0, 0.0), Point3::new(4.0, 4.0, 4.0));
    let hierarchy = Hierarchy::new(structure, bounds).expect("hierarchy");

    hierarchy.track(&Point3::new(1.0, 1.0, 0.5), 2).expect("track");
    hierarchy.track(&Point3::new(1.0, 1.0, 3.5), 2).expect("track");

    let out = hierarchy.query(&bounds, 0, 2).expect("query");
    assert_eq!(out["n"], json!(2));
    assert_eq!(out["sw"]["n"], json!(2));
}

/// Merging subset hierarchies built over disjoint halves sums counts
/// at every shared ancestor.
#[test]
fn merged_subsets_sum_everywhere() {
    let structure = quad_structure(3);
    let bounds = square(4.0);

    let west = Hierarchy::new(structure.clone(), bounds).expect("hierarchy");
    let east = Hierarchy::new(structure.clone(), bounds).expect("hierarchy");
    let merged = Hierarchy::new(structure.clone(), bounds).expect("hierarchy");

    let points_west = [(0.3, 1.0), (1.2, 3.1), (1.9, 0.4)];
    let points_east = [(2.3, 1.0), (3.2, 3.1), (2.9, 0.4), (3.9, 3.9)];

    for (x, y) in points_west {
        west.track(&Point3::flat(x, y), 5).expect("track");
    }
    for (x, y) in points_east {
        east.track(&Point3::flat(x, y), 5).expect("track");
    }

    merged.merge(&west).expect("merge west");
    merged.merge(&east).expect("merge east");

    fn check(
        merged: &Hierarchy,
        west: &Hierarchy,
        east: &Hierarchy,
        state: &PointState<'_>,
        depth_end: u64,
    ) {
        let sum = west.get(state).expect("west") + east.get(state).expect("east");
        assert_eq!(merged.get(state).expect("merged"), sum);

        if state.depth() == depth_end || sum == 0 {
            return;
        }
        for dir in cloudtree::Dir::iter(4) {
            let child = state.climb(dir).expect("climb");
            check(merged, west, east, &child, depth_end);
        }
    }

    let root = PointState::new(&structure, bounds);
    check(&merged, &west, &east, &root, 5);

    let out = merged.query(&bounds, 0, 2).expect("query");
    assert_eq!(out["n"], json!(7));
}

//! The full read path: base phase, chunk fetches through the cache,
//! predicates, and output packing.

use std::sync::Arc;

use cloudtree::{
    pack_record, Bounds, Cache, CloudtreeError, Codec, Dim, DimKind, Endpoint, Hierarchy, Id,
    MemoryEndpoint, Point3, PointRecord, RawCodec, Reader, Schema, Structure,
    StructureConfig, SubEndpoint, HIERARCHY_PREFIX,
};

fn structure() -> Structure {
    Structure::new(StructureConfig {
        base_depth: 2,
        dimensions: 2,
        points_per_chunk: 8,
        ..Default::default()
    })
    .expect("structure")
}

fn bounds() -> Bounds {
    Bounds::new(Point3::flat(0.0, 0.0), Point3::flat(4.0, 4.0))
}

fn schema() -> Schema {
    Schema::new(vec![
        Dim::new("X", DimKind::F64),
        Dim::new("Y", DimKind::F64),
        Dim::new("Z", DimKind::F64),
        Dim::new("Intensity", DimKind::U16),
    ])
}

fn record(schema: &Schema, x: f64, y: f64, depth: u64, intensity: f64) -> PointRecord {
    let p = Point3::flat(x, y);
    PointRecord::new(p, depth, pack_record(schema, &p, &[intensity]))
}

/// Build a small dataset on a memory endpoint: two base points, one
/// depth-2 chunk covering the whole region, one depth-3 chunk covering
/// the south-west quadrant.
fn build_dataset() -> Arc<MemoryEndpoint> {
    tracing_subscriber::fmt::try_init().ok();

    let endpoint = Arc::new(MemoryEndpoint::new());
    let schema = schema();
    let codec = RawCodec;

    let base = vec![
        record(&schema, 0.5, 0.5, 1, 10.0),
        record(&schema, 3.5, 3.5, 1, 20.0),
    ];

    let chunk_root = vec![
        record(&schema, 0.5, 0.5, 2, 30.0),
        record(&schema, 2.5, 2.5, 2, 40.0),
        record(&schema, 1.5, 0.5, 2, 50.0),
    ];

    let chunk_sw = vec![
        record(&schema, 0.25, 0.25, 3, 60.0),
        record(&schema, 1.75, 1.75, 3, 70.0),
    ];

    endpoint
        .put("base", codec.encode(&schema, &base).expect("encode"))
        .expect("put");
    // Chunk ids follow the chunk cursor: the nominal chunk is id 5,
    // its south-west child 21.
    endpoint
        .put("5", codec.encode(&schema, &chunk_root).expect("encode"))
        .expect("put");
    endpoint
        .put("21", codec.encode(&schema, &chunk_sw).expect("encode"))
        .expect("put");

    // Counts go into the hierarchy derived from the tree structure,
    // which is the structure the reader loads against.
    let hstructure = Structure::hierarchy_from(&structure()).expect("hierarchy structure");
    let hierarchy = Hierarchy::new(hstructure, bounds()).expect("hierarchy");
    for point in base.iter().chain(&chunk_root).chain(&chunk_sw) {
        hierarchy.track(&point.point, point.depth).expect("track");
    }
    let blocks = SubEndpoint::new(endpoint.clone(), HIERARCHY_PREFIX);
    hierarchy.save(&blocks, "").expect("save");

    endpoint
}

fn drain(query: &mut cloudtree::Query<'_>) -> Vec<u8> {
    let mut buffer = Vec::new();
    loop {
        match query.next(&mut buffer) {
            Ok(true) => continue,
            Ok(false) => return buffer,
            Err(e) => panic!("query failed: {e}"),
        }
    }
}

// (x, y, z, intensity) tuples from a packed buffer in the native
// schema layout.
fn unpack(buffer: &[u8]) -> Vec<(f64, f64, f64, u16)> {
    let stride = 26;
    assert_eq!(buffer.len() % stride, 0);
    buffer
        .chunks(stride)
        .map(|rec| {
            (
                f64::from_le_bytes(rec[0..8].try_into().unwrap()),
                f64::from_le_bytes(rec[8..16].try_into().unwrap()),
                f64::from_le_bytes(rec[16..24].try_into().unwrap()),
                u16::from_le_bytes(rec[24..26].try_into().unwrap()),
            )
        })
        .collect()
}

#[test]
fn box_query_spans_base_and_chunks() {
    let endpoint = build_dataset();
    let reader = Reader::open(
        structure(),
        bounds(),
        schema(),
        endpoint,
        Arc::new(RawCodec),
    )
    .expect("reader");
    let cache = Cache::new(1 << 20);

    let qbox = Bounds::new(Point3::flat(0.0, 0.0), Point3::flat(2.0, 2.0));
    let mut query = reader.query(schema(), &cache, qbox, 0, 10, 1.0, Point3::default());
    let buffer = drain(&mut query);

    assert_eq!(query.num_points(), 5);
    let mut intensities: Vec<u16> = unpack(&buffer).iter().map(|r| r.3).collect();
    intensities.sort_unstable();
    // Base point 10, root-chunk points 30 and 50, south-west chunk
    // points 60 and 70; the two points outside the box stay out.
    assert_eq!(intensities, vec![10, 30, 50, 60, 70]);
}

#[test]
fn depth_band_excludes_base_points() {
    let endpoint = build_dataset();
    let reader = Reader::open(
        structure(),
        bounds(),
        schema(),
        endpoint,
        Arc::new(RawCodec),
    )
    .expect("reader");
    let cache = Cache::new(1 << 20);

    let mut query = reader.query(schema(), &cache, bounds(), 2, 3, 1.0, Point3::default());
    let buffer = drain(&mut query);

    assert_eq!(query.num_points(), 3);
    let mut intensities: Vec<u16> = unpack(&buffer).iter().map(|r| r.3).collect();
    intensities.sort_unstable();
    assert_eq!(intensities, vec![30, 40, 50]);
}

#[test]
fn spatial_values_are_offset_and_scaled() {
    let endpoint = build_dataset();
    let reader = Reader::open(
        structure(),
        bounds(),
        schema(),
        endpoint,
        Arc::new(RawCodec),
    )
    .expect("reader");
    let cache = Cache::new(1 << 20);

    let qbox = Bounds::new(Point3::flat(0.4, 0.4), Point3::flat(0.6, 0.6));
    let mut query =
        reader.query(schema(), &cache, qbox, 0, 2, 2.0, Point3::flat(1.0, 1.0));
    let buffer = drain(&mut query);

    // Only the depth-1 base point at (0.5, 0.5).
    let records = unpack(&buffer);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, (0.5 - 1.0) * 2.0);
    assert_eq!(records[0].1, -1.0);
    assert_eq!(records[0].3, 10);
}

#[test]
fn narrow_output_schema_packs_selected_dims() {
    let endpoint = build_dataset();
    let reader = Reader::open(
        structure(),
        bounds(),
        schema(),
        endpoint,
        Arc::new(RawCodec),
    )
    .expect("reader");
    let cache = Cache::new(1 << 20);

    let out = Schema::new(vec![
        Dim::new("X", DimKind::F32),
        Dim::new("Intensity", DimKind::U16),
    ]);
    let qbox = Bounds::new(Point3::flat(0.2, 0.2), Point3::flat(0.3, 0.3));
    let mut query = reader.query(out, &cache, qbox, 3, 4, 1.0, Point3::default());
    let buffer = drain(&mut query);

    // Only the (0.25, 0.25) chunk point; 6 bytes per record.
    assert_eq!(query.num_points(), 1);
    assert_eq!(buffer.len(), 6);
    assert_eq!(f32::from_le_bytes(buffer[0..4].try_into().unwrap()), 0.25);
    assert_eq!(u16::from_le_bytes(buffer[4..6].try_into().unwrap()), 60);
}

#[test]
fn cancel_stops_the_query() {
    let endpoint = build_dataset();
    let reader = Reader::open(
        structure(),
        bounds(),
        schema(),
        endpoint,
        Arc::new(RawCodec),
    )
    .expect("reader");
    let cache = Cache::new(1 << 20);

    let mut query = reader.query(schema(), &cache, bounds(), 0, 10, 1.0, Point3::default());
    let mut buffer = Vec::new();
    assert!(query.next(&mut buffer).expect("next"));

    query.cancel();
    assert!(query.done());
    assert!(!query.next(&mut buffer).expect("next"));
}

#[test]
fn tiny_cache_budget_is_exhausted() {
    let endpoint = build_dataset();
    let reader = Reader::open(
        structure(),
        bounds(),
        schema(),
        endpoint,
        Arc::new(RawCodec),
    )
    .expect("reader");
    let cache = Cache::new(10);

    let mut query = reader.query(schema(), &cache, bounds(), 0, 10, 1.0, Point3::default());
    let mut buffer = Vec::new();
    assert!(query.next(&mut buffer).expect("base phase"));

    let err = query.next(&mut buffer);
    assert!(matches!(err, Err(CloudtreeError::CacheExhausted { .. })));
}

#[test]
fn missing_hierarchy_yields_base_points_only() {
    // Chunks exist on storage but no hierarchy was saved: the chunked
    // traversal has nothing to steer by and stays home.
    let endpoint = Arc::new(MemoryEndpoint::new());
    let schema = schema();
    let base = vec![record(&schema, 0.5, 0.5, 1, 10.0)];
    endpoint
        .put("base", RawCodec.encode(&schema, &base).expect("encode"))
        .expect("put");
    endpoint
        .put(
            "5",
            RawCodec
                .encode(&schema, &[record(&schema, 1.5, 1.5, 2, 30.0)])
                .expect("encode"),
        )
        .expect("put");

    let reader = Reader::open(
        structure(),
        bounds(),
        schema.clone(),
        endpoint,
        Arc::new(RawCodec),
    )
    .expect("reader");
    let cache = Cache::new(1 << 20);

    let mut query = reader.query(schema, &cache, bounds(), 0, 10, 1.0, Point3::default());
    let buffer = drain(&mut query);
    assert_eq!(query.num_points(), 1);
    assert_eq!(unpack(&buffer).len(), 1);
}

#[test]
fn chunk_ids_match_the_cursor() {
    // The ids the dataset was written under are the ones the chunk
    // cursor derives.
    let s = structure();
    let b = bounds();
    let cs = cloudtree::ChunkState::new(&s, b);
    assert_eq!(cs.chunk_id(), Id::from(5));
    assert_eq!(
        cs.climb(cloudtree::Dir::Swd).expect("climb").chunk_id(),
        Id::from(21)
    );
}

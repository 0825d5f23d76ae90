use evokedlab::core::SampleBlock;
use evokedlab::engine::StageGraph;
use serde_json::json;

fn ramp(n: usize, fs: f64) -> SampleBlock {
    SampleBlock::mono(0, fs, (0..n).map(|v| v as f64).collect())
}

#[test]
fn test_graph_from_json_with_tap() {
    let mut graph = StageGraph::from_json(&json!({
        "nodes": [
            {"id": "gain", "type": "Gain", "config": {"gain": 2.0}, "tap": true},
            {"id": "ds", "type": "Downsample", "config": {"q": 2}},
            {"id": "offset", "type": "Transform", "config": {"op": "linear", "offset": 1.0}}
        ],
        "connections": [
            {"from": "gain", "to": "ds"},
            {"from": "ds", "to": "offset"}
        ]
    }))
    .unwrap();
    assert_eq!(graph.sinks(), vec!["offset"]);

    let out = graph.push(ramp(8, 1000.0)).unwrap();
    assert_eq!(out["gain"][0].channel(0), &[0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0]);
    let tail = &out["offset"][0];
    assert_eq!(tail.channel(0), &[1.0, 5.0, 9.0, 13.0]);
    assert_eq!(tail.fs, 500.0);
    assert!(!out.contains_key("ds"));
}

#[test]
fn test_failing_stage_degrades_to_nan() {
    // Corner above Nyquist only fails once the sample rate is known
    let mut graph = StageGraph::from_json(&json!({
        "nodes": [
            {"id": "lp", "type": "IIR Filter", "config": {"btype": "lowpass", "fh": 600.0}},
            {"id": "gain", "type": "Gain", "config": {"gain_db": 6.0}}
        ],
        "connections": [{"from": "lp", "to": "gain"}]
    }))
    .unwrap();

    let out = graph.push(ramp(16, 1000.0)).unwrap();
    let block = &out["gain"][0];
    assert_eq!(block.n_samples(), 16);
    assert!(block.channel(0).iter().all(|v| v.is_nan()));

    let lp = graph.metrics().get_stage_metrics("lp").unwrap();
    assert_eq!(lp.errors(), 1);
    let gain = graph.metrics().get_stage_metrics("gain").unwrap();
    assert_eq!(gain.blocks_in(), 1);
}

#[test]
fn test_skip_policy_drops_block() {
    let mut graph = StageGraph::from_json(&json!({
        "nodes": [{"id": "lp", "type": "IIR Filter", "policy": "skip",
                   "config": {"btype": "lowpass", "fh": 600.0}}],
        "connections": []
    }))
    .unwrap();
    let out = graph.push(ramp(4, 1000.0)).unwrap();
    assert!(out.get("lp").map(|b| b.is_empty()).unwrap_or(true));
}

#[test]
fn test_out_of_range_samples_flow_as_nan() {
    let mut graph = StageGraph::from_json(&json!({
        "nodes": [
            {"id": "clip", "type": "Transform", "config": {"lower": 0.0, "upper": 2.0}},
            {"id": "gain", "type": "Gain", "config": {"gain": 10.0}}
        ],
        "connections": [{"from": "clip", "to": "gain"}]
    }))
    .unwrap();
    let out = graph.push(ramp(4, 100.0)).unwrap();
    let c = out["gain"][0].channel(0).to_vec();
    assert_eq!(&c[..3], &[0.0, 10.0, 20.0]);
    assert!(c[3].is_nan());
}

#[test]
fn test_invalid_graphs_rejected() {
    assert!(StageGraph::from_json(&json!({
        "nodes": [{"id": "x", "type": "Reverb", "config": {}}]
    }))
    .is_err());

    assert!(StageGraph::from_json(&json!({
        "nodes": [{"id": "x", "type": "Gain", "config": {}}],
        "connections": [{"from": "x", "to": "missing"}]
    }))
    .is_err());

    assert!(StageGraph::from_json(&json!({
        "nodes": [{"id": "ds", "type": "Downsample", "config": {"q": 0}}]
    }))
    .is_err());
}

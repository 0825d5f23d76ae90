use evokedlab::core::SampleBlock;
use evokedlab::registry::{create_stage, find_stage, list_stages};
use serde_json::json;

#[test]
fn test_inventory_collects_all_stages() {
    // Force the stage modules to be linked
    use evokedlab::stages::*;
    let _ = (
        IirFilter::default(),
        Gain::default(),
        Rms::default(),
        Spl::default(),
        Downsample::default(),
        Blocked::default(),
        Transform::default(),
    );

    let ids: Vec<String> = list_stages().into_iter().map(|m| m.id).collect();
    for id in ["Blocked", "Downsample", "Gain", "IirFilter", "Rms", "Spl", "Transform"] {
        assert!(ids.iter().any(|i| i == id), "{} not registered", id);
    }
}

#[test]
fn test_lookup_by_id_or_display_name() {
    let by_name = find_stage("IIR Filter").unwrap();
    let by_id = find_stage("IirFilter").unwrap();
    assert_eq!(by_name.id, by_id.id);
    assert_eq!(by_name.category, "Filters");
    assert!(find_stage("Reverb").is_none());
}

#[test]
fn test_parameter_schema() {
    let rms = find_stage("RMS").unwrap();
    let duration = rms.parameter("duration").unwrap();
    assert_eq!(duration.param_type, "number");
    assert_eq!(duration.default, json!(0.1));
    assert_eq!(duration.min, Some(0.0));
    assert_eq!(rms.outputs[0].name, "Vrms");
}

#[test]
fn test_create_configures_instance() {
    let mut gain = create_stage("Gain", json!({"gain": 3.0})).unwrap();
    let out = gain
        .process(SampleBlock::mono(0, 1.0, vec![1.0, -2.0]))
        .unwrap();
    assert_eq!(out[0].channel(0), &[3.0, -6.0]);

    assert!(create_stage("Transform", json!({"op": "cube"})).is_err());
    assert!(create_stage("IIR Filter", json!({"btype": "bandpass", "fl": 500.0, "fh": 100.0})).is_err());
}

#[test]
fn test_config_checked_against_schema() {
    assert!(create_stage("Downsample", json!({"q": 0})).is_err());
    assert!(create_stage("Gain", json!({"gain": "loud"})).is_err());
    assert!(create_stage("RMS", json!({"duration": -0.5})).is_err());
    assert!(create_stage("Gain", json!([1.0])).is_err());
    assert!(create_stage("Gain", serde_json::Value::Null).is_ok());
}

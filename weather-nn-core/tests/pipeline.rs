use std::{fmt::Write as _, fs, path::Path};

use weather_nn_core::{
    LabelFile, PipelineConfig, QuantizedModel, WeatherCategory,
    dataset::load_dataset,
    error::LoadError,
    make_sequences,
    pipeline::{self, prepare},
};

fn write_csv(path: &Path, rows: &[(&str, f32, f32, i64)]) {
    let mut text =
        String::from("time,temperature_2m (°C),pressure_msl (hPa),weather_code (wmo code)\n");
    for (time, temp, pressure, code) in rows {
        let _ = writeln!(text, "{time},{temp},{pressure},{code}");
    }
    fs::write(path, text).expect("write csv");
}

/// Two regimes a window can tell apart: warm and high pressure means clear,
/// cold and low pressure means snow.
fn synthetic_rows(n: usize) -> Vec<(String, f32, f32, i64)> {
    (0..n)
        .map(|i| {
            let day = i / 24 + 1;
            let month = (i / 24) % 12 + 1;
            let block = (i / 6) % 2 == 0;
            let (temp, pressure, code) = if block {
                (20.0 + (i % 6) as f32 * 0.3, 1025.0, 0)
            } else {
                (-5.0 - (i % 6) as f32 * 0.3, 990.0, 71)
            };
            (
                format!("2023-{month:02}-{:02}T{:02}:00", day % 28 + 1, i % 24),
                temp,
                pressure,
                code,
            )
        })
        .collect()
}

#[test]
fn small_dataset_yields_expected_sequences() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("weather.csv");
    write_csv(
        &path,
        &[
            ("2024-01-01T00:00", 1.0, 1000.0, 0),
            ("2024-01-01T01:00", 2.0, 1001.0, 61),
            ("2024-01-01T02:00", 3.0, 1002.0, 71),
            ("2024-01-01T03:00", 4.0, 1003.0, 999),
            ("2024-01-01T04:00", 5.0, 1004.0, 0),
            ("2024-01-01T05:00", 6.0, 1005.0, 61),
        ],
    );

    let dataset = load_dataset(&path).expect("load");
    assert_eq!(dataset.num_features(), 4);
    assert_eq!(dataset.mapping.unlisted_codes(), vec![999]);

    let set = make_sequences(dataset.features.view(), &dataset.labels, 2).expect("sequences");
    assert_eq!(set.len(), 4);
    // Labels of rows 2..6: snow, other, clear, rain.
    assert_eq!(set.labels, vec![4, 5, 0, 3]);
    assert!(set.labels.iter().all(|l| [0, 3, 4, 5].contains(l)));
}

#[test]
fn missing_target_column_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("weather.csv");
    fs::write(&path, "time,temp\n2024-01-01T00:00,1.0\n").expect("write");

    let err = load_dataset(&path).unwrap_err();
    assert!(matches!(err, LoadError::MissingTargetColumn { .. }));
}

#[test]
fn full_pipeline_trains_and_exports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_path = dir.path().join("weather.csv");
    let rows = synthetic_rows(240);
    let borrowed: Vec<(&str, f32, f32, i64)> = rows
        .iter()
        .map(|(t, a, b, c)| (t.as_str(), *a, *b, *c))
        .collect();
    write_csv(&data_path, &borrowed);

    let mut config = PipelineConfig::default();
    config.data.path = data_path;
    config.model.conv1_filters = 8;
    config.model.conv2_filters = 8;
    config.model.dense_units = 16;
    config.model.learning_rate = 0.01;
    config.train.epochs = 15;
    config.train.batch_size = 32;
    config.train.history_path = Some(dir.path().join("history.json"));
    config.export.model_path = dir.path().join("model.wxq");
    config.export.c_header_path = Some(dir.path().join("model_data.h"));

    let report = pipeline::run(&config).expect("pipeline");

    assert_eq!(report.rows, 240);
    assert_eq!(report.train_samples + report.validation_samples, 236);
    assert_eq!(report.validation_samples, 48);
    assert!(!report.history.epochs.is_empty());
    assert!(report.history.epochs.len() <= 15);
    assert!(report.evaluation.accuracy > 0.5);
    assert!(report.agreement >= 0.8, "agreement {}", report.agreement);

    let bytes = fs::read(&config.export.model_path).expect("artifact");
    assert_eq!(bytes.len(), report.export.bytes);
    let model = QuantizedModel::from_bytes(&bytes).expect("parse");
    assert_eq!(model.window_size, 4);
    assert_eq!(model.num_features, 4);
    assert_eq!(model.num_classes, 6);
    assert_eq!(model.feature_min.len(), 4);
    assert_eq!(report.export.calibration_samples, 100);

    let labels: LabelFile = serde_json::from_str(
        &fs::read_to_string(dir.path().join("model.labels.json")).expect("labels"),
    )
    .expect("labels json");
    assert_eq!(labels.labels[WeatherCategory::Snow.index()], "snow");
    assert_eq!(labels.codes.get(&71).map(String::as_str), Some("snow"));

    assert!(dir.path().join("model_data.h").exists());
    assert!(dir.path().join("history.json").exists());
}

#[test]
fn strict_mode_keeps_validation_rows_unseen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_path = dir.path().join("weather.csv");
    let rows = synthetic_rows(50);
    let borrowed: Vec<(&str, f32, f32, i64)> = rows
        .iter()
        .map(|(t, a, b, c)| (t.as_str(), *a, *b, *c))
        .collect();
    write_csv(&data_path, &borrowed);

    let mut config = PipelineConfig::default();
    config.train.strict_split = true;
    let dataset = load_dataset(&data_path).expect("load");
    let data = prepare(dataset, &config).expect("prepare");

    // 40 training rows and 10 validation rows, each windowed separately.
    assert_eq!(data.train.len(), 36);
    assert_eq!(data.validation.len(), 6);
}

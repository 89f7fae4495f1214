use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::process::Command;

fn skyscan() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_skyscan"));
    command.env_clear().env("PATH", std::env::var_os("PATH").unwrap_or_default());
    command
}

fn write_model(dir: &Path) -> PathBuf {
    let path = dir.join("model.json");
    std::fs::write(
        &path,
        r#"{
            "metadata": {
                "name": "water-field",
                "version": "1.0",
                "description": "water versus fields",
                "category": "landcover",
                "labels": ["water", "field"],
                "model_size": [32, 32],
                "color_mode": "rgb"
            },
            "batch_size": 8,
            "weights": {
                "water": {"bias": 0.0, "coefficients": [-8.0, -8.0, 12.0, 0.0, 0.0, 0.0]},
                "field": {"bias": 0.0, "coefficients": [8.0, 8.0, -4.0, 0.0, 0.0, 0.0]}
            }
        }"#,
    )
    .unwrap();
    path
}

fn write_image(dir: &Path) -> PathBuf {
    let path = dir.join("scene.png");
    RgbImage::from_fn(128, 64, |x, _| {
        if x < 64 { Rgb([10, 20, 200]) } else { Rgb([200, 220, 40]) }
    })
    .save(&path)
    .unwrap();
    path
}

#[test]
fn landcover_run_writes_features_from_a_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let model = write_model(dir.path());
    let image = write_image(dir.path());
    let output = dir.path().join("cover.geojson");
    let config = dir.path().join("run.toml");
    std::fs::write(
        &config,
        format!(
            "model = {:?}\nimage = {:?}\nproducer-info = true\n",
            model.display().to_string(),
            image.display().to_string()
        ),
    )
    .unwrap();

    let status = skyscan()
        .args(["landcover", "--quiet", "--config"])
        .arg(&config)
        .arg("--output")
        .arg(&output)
        .status()
        .unwrap();
    assert!(status.success());

    let root: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    let features = root["features"].as_array().unwrap();
    assert_eq!(features.len(), 8);
    assert_eq!(features[0]["properties"]["app"], "skyscan");
}

#[test]
fn environment_supplies_options() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("cover.geojsonl");
    let status = skyscan()
        .env("SKYSCAN_MODEL", write_model(dir.path()))
        .env("SKYSCAN_IMAGE", write_image(dir.path()))
        .env("SKYSCAN_OUTPUT", &output)
        .args(["landcover", "--quiet"])
        .status()
        .unwrap();
    assert!(status.success());
    assert_eq!(std::fs::read_to_string(&output).unwrap().lines().count(), 8);
}

#[test]
fn invalid_arguments_fail() {
    let dir = tempfile::tempdir().unwrap();
    let output = skyscan()
        .args(["detect", "--quiet", "--image"])
        .arg(write_image(dir.path()))
        .args(["--service", "xyz"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("may not be specified at the same time"));
}

fn read_root(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn environment_supplies_list_options() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("water.geojson");
    let log = dir.path().join("run.log");
    let status = skyscan()
        .env("SKYSCAN_MODEL", write_model(dir.path()))
        .env("SKYSCAN_IMAGE", write_image(dir.path()))
        .env("SKYSCAN_OUTPUT", &output)
        .env("SKYSCAN_WINDOW_STEP", "32")
        .env("SKYSCAN_CONFIDENCE", "50")
        .env("SKYSCAN_INCLUDE_LABELS", "water,lake")
        .env("SKYSCAN_LOG", format!("debug,{}", log.display()))
        .args(["detect", "--quiet"])
        .status()
        .unwrap();
    assert!(status.success());

    let root = read_root(&output);
    let features = root["features"].as_array().unwrap();
    assert_eq!(features.len(), 4);
    for feature in features {
        assert_eq!(feature["properties"]["top_cat"], "water");
    }
    assert!(log.exists());
}

#[test]
fn environment_names_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("run.toml");
    std::fs::write(
        &config,
        format!(
            "model = {:?}\nimage = {:?}\n",
            write_model(dir.path()).display().to_string(),
            write_image(dir.path()).display().to_string()
        ),
    )
    .unwrap();
    let output = dir.path().join("cover.geojson");
    let status = skyscan()
        .env("SKYSCAN_CONFIG", &config)
        .arg("landcover")
        .arg("--quiet")
        .arg("--output")
        .arg(&output)
        .status()
        .unwrap();
    assert!(status.success());
    assert_eq!(read_root(&output)["features"].as_array().unwrap().len(), 8);
}

#[test]
fn command_line_beats_environment_beats_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("run.toml");
    std::fs::write(
        &config,
        format!(
            "model = {:?}\nimage = {:?}\noutput-layer = \"from_config\"\n",
            write_model(dir.path()).display().to_string(),
            write_image(dir.path()).display().to_string()
        ),
    )
    .unwrap();

    let run = |output: &Path, layer: Option<&str>| {
        let mut command = skyscan();
        command
            .env("SKYSCAN_OUTPUT_LAYER", "from_env")
            .args(["landcover", "--quiet", "--config"])
            .arg(&config)
            .arg("--output")
            .arg(output);
        if let Some(layer) = layer {
            command.args(["--output-layer", layer]);
        }
        assert!(command.status().unwrap().success());
        read_root(output)["name"].clone()
    };

    assert_eq!(run(&dir.path().join("env.geojson"), None), "from_env");
    assert_eq!(run(&dir.path().join("cli.geojson"), Some("from_cli")), "from_cli");

    let output = dir.path().join("config.geojson");
    let status = skyscan()
        .args(["landcover", "--quiet", "--config"])
        .arg(&config)
        .arg("--output")
        .arg(&output)
        .status()
        .unwrap();
    assert!(status.success());
    assert_eq!(read_root(&output)["name"], "from_config");
}

#[test]
fn zero_window_size_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let output = skyscan()
        .env("SKYSCAN_WINDOW_SIZE", "0")
        .args(["detect", "--quiet", "--image"])
        .arg(write_image(dir.path()))
        .arg("--model")
        .arg(write_model(dir.path()))
        .arg("--output")
        .arg(dir.path().join("out.geojson"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("greater than zero"));
}

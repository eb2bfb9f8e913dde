use std::path::Path;

use burn::{backend::{Autodiff, NdArray}, module::AutodiffModule, tensor::{Tensor, TensorData}};
use hoi::{config::DatasetFile, DetrHoiToolkit, HoiConfig, RunMode, RunOutcome, VisualRelation};
use image::{Rgb, RgbImage};
use serde_json::json;

type TestBackend = Autodiff<NdArray<f32>>;

fn write_dataset(root: &Path) {
    let record = |file_name: &str| {
        json!({
            "file_name": file_name,
            "annotations": [
                { "bbox": [0.0, 0.0, 16.0, 30.0], "category_id": 1 },
                { "bbox": [16.0, 8.0, 30.0, 24.0], "category_id": 3 }
            ],
            "hoi_annotation": [{ "subject_id": 0, "object_id": 1, "category_id": 2 }]
        })
    };
    let annotations = json!([record("a.png"), record("b.png")]);

    let annotation_dir = root.join("annotations");
    std::fs::create_dir_all(&annotation_dir).unwrap();
    for split in ["trainval_hico.json", "test_hico.json"] {
        std::fs::write(annotation_dir.join(split), annotations.to_string()).unwrap();
    }
    for split in ["train2015", "test2015"] {
        let dir = root.join("images").join(split);
        std::fs::create_dir_all(&dir).unwrap();
        RgbImage::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 64])).save(dir.join("a.png")).unwrap();
        RgbImage::from_pixel(32, 32, Rgb([200, 10, 10])).save(dir.join("b.png")).unwrap();
    }
}

fn tiny_config(root: &Path) -> HoiConfig {
    HoiConfig {
        hoi_path: root.to_path_buf(),
        output_dir: root.join("out"),
        dataset_file: DatasetFile::Hico,
        pretrained: String::new(),
        backbone: "resnet18".to_string(),
        hidden_dim: 16,
        nheads: 2,
        nheads_hoi: 2,
        dim_feedforward: 32,
        dim_feedforward_hoi: 32,
        enc_layers: 1,
        dec_layers: 2,
        hoi_enc_layers: 1,
        hoi_dec_layers: 1,
        num_queries: 4,
        dropout: 0.0,
        batch_size: 2,
        num_workers: 0,
        epochs: 1,
        ..HoiConfig::controller_default()
    }
}

/// Inference-mode verb logits for a constant image.
fn verb_logits(relation: &VisualRelation<TestBackend, DetrHoiToolkit>) -> TensorData {
    let image = Tensor::ones([1, 3, 32, 32], &Default::default());
    relation.model().raw().valid().forward(image).main.verb_logits.into_data()
}

#[test]
fn one_epoch_on_a_tiny_dataset() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let config = tiny_config(dir.path());

    let mut relation = VisualRelation::<TestBackend, _>::new("hoi", false, config, DetrHoiToolkit::new(32), Default::default()).unwrap();
    assert!(relation.n_parameters() > 0);
    assert!(!relation.param_groups().backbone.is_empty());
    assert!(!relation.param_groups().rest.is_empty());
    let before = verb_logits(&relation);

    let RunOutcome::Trained(summary) = relation.run(RunMode::Train).unwrap() else {
        panic!("train must train");
    };
    // every parameter group was stepped
    assert_ne!(verb_logits(&relation), before);

    let train = summary.last_train_stats.unwrap();
    assert!(train.get("loss").is_some_and(f64::is_finite));
    assert!(train.get("loss_verb_ce").is_some());
    assert!(train.get("loss_sub_bbox_0").is_some());

    let test = summary.last_test_stats.unwrap();
    let map = test.get("mAP").unwrap();
    assert!((0.0..=1.0).contains(&map));
    // the only triplet occurs twice in training, below the rare threshold
    assert_eq!(test.get("mAP non-rare"), Some(0.0));
    assert!(dir.path().join("out").join("checkpoint.mpk").exists());
}

#[test]
fn evaluation_reports_every_map_split() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let config = tiny_config(dir.path());

    let mut relation = VisualRelation::<TestBackend, _>::new("hoi", false, config, DetrHoiToolkit::new(32), Default::default()).unwrap();
    let RunOutcome::Evaluated(stats) = relation.run(RunMode::Eval).unwrap() else {
        panic!("eval must not train");
    };
    for key in ["mAP", "mAP rare", "mAP non-rare", "mean max recall"] {
        assert!(stats.get(key).is_some(), "missing {key}");
    }
    assert!(!dir.path().join("out").join("log.txt").exists());
}

use std::{collections::HashMap, fs::File, io::BufReader, path::{Path, PathBuf}};

use burn::{data::{dataloader::batcher::Batcher, dataset::Dataset}, tensor::{backend::Backend, Tensor, TensorData}};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{config::DatasetFile, error::{HoiError, Result}, model::box_ops::BoxXyxy, toolkit::ImageSet};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// COCO category ids that are actually used, in contiguous-label order.
pub const COCO_VALID_IDS: [usize; 80] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 14, 15, 16, 17, 18, 19, 20, 21,
    22, 23, 24, 25, 27, 28, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44,
    46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63, 64, 65,
    67, 70, 72, 73, 74, 75, 76, 77, 78, 79, 80, 81, 82, 84, 85, 86, 87, 88, 89, 90,
];

pub fn coco_label(category_id: usize) -> Option<usize> {
    COCO_VALID_IDS.iter().position(|&id| id == category_id)
}

#[derive(Debug, Clone, Deserialize)]
struct RawBox {
    bbox: [f32; 4],
    category_id: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct RawHoi {
    subject_id: i64,
    object_id: i64,
    category_id: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRecord {
    file_name: String,
    #[serde(default)]
    annotations: Vec<RawBox>,
    #[serde(default)]
    hoi_annotation: Vec<RawHoi>,
}

/// `object` is `None` for interactions without an object (V-COCO).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoiAnnotation {
    pub subject: usize,
    pub object: Option<usize>,
    pub verb: usize,
}

/// One annotated image; pixels are loaded by the batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct HoiSample {
    pub image_path: PathBuf,
    pub file_name: String,
    /// Pixel xyxy boxes.
    pub boxes: Vec<[f32; 4]>,
    /// Contiguous object labels, one per box.
    pub labels: Vec<usize>,
    pub hois: Vec<HoiAnnotation>,
}

/// Training and evaluation targets of one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HoiTarget {
    pub file_name: String,
    /// `[height, width]` of the image before resizing.
    pub orig_size: [usize; 2],
    /// Per subject-object pair.
    pub obj_labels: Vec<usize>,
    pub verb_labels: Vec<Vec<f32>>,
    /// Normalized cxcywh per pair; object boxes are zero when there is no object.
    pub sub_boxes: Vec<[f32; 4]>,
    pub obj_boxes: Vec<[f32; 4]>,
    /// Ground truth as annotated, for evaluation.
    pub boxes: Vec<[f32; 4]>,
    pub labels: Vec<usize>,
    pub hois: Vec<HoiAnnotation>,
}

impl HoiTarget {
    /// Groups interactions by subject-object pair into multi-hot verb rows.
    pub fn from_sample(sample: &HoiSample, orig_size: [usize; 2], num_obj_classes: usize, num_verb_classes: usize) -> Self {
        let [height, width] = orig_size;
        let normalize = |b: &[f32; 4]| {
            let clamped = BoxXyxy::new(
                b[0].clamp(0.0, width as f32),
                b[1].clamp(0.0, height as f32),
                b[2].clamp(0.0, width as f32),
                b[3].clamp(0.0, height as f32),
            );
            let [cx, cy, w, h] = clamped.to_cxcywh();
            [cx / width.max(1) as f32, cy / height.max(1) as f32, w / width.max(1) as f32, h / height.max(1) as f32]
        };

        let mut target = HoiTarget {
            file_name: sample.file_name.clone(),
            orig_size,
            boxes: sample.boxes.clone(),
            labels: sample.labels.clone(),
            hois: sample.hois.clone(),
            ..Default::default()
        };
        let mut pairs: HashMap<(usize, Option<usize>), usize> = HashMap::new();
        for hoi in &sample.hois {
            let pair = *pairs.entry((hoi.subject, hoi.object)).or_insert_with(|| {
                target.sub_boxes.push(normalize(&sample.boxes[hoi.subject]));
                match hoi.object {
                    Some(object) => {
                        target.obj_labels.push(sample.labels[object]);
                        target.obj_boxes.push(normalize(&sample.boxes[object]));
                    }
                    None => {
                        target.obj_labels.push(num_obj_classes);
                        target.obj_boxes.push([0.0; 4]);
                    }
                }
                target.verb_labels.push(vec![0.0; num_verb_classes]);
                target.obj_labels.len() - 1
            });
            target.verb_labels[pair][hoi.verb] = 1.0;
        }
        target
    }

    pub fn num_pairs(&self) -> usize {
        self.obj_labels.len()
    }

    pub fn has_object_box(&self, pair: usize) -> bool {
        self.obj_boxes[pair].iter().any(|v| *v != 0.0)
    }
}

/// HICO-DET / V-COCO annotations in the flat JSON layout.
#[derive(Debug, Clone)]
pub struct HoiDataset {
    samples: Vec<HoiSample>,
}

impl HoiDataset {
    pub fn annotation_file(root: &Path, dataset_file: DatasetFile, image_set: ImageSet) -> PathBuf {
        let prefix = match image_set {
            ImageSet::Train => "trainval",
            ImageSet::Val => "test",
        };
        root.join("annotations").join(format!("{prefix}_{}.json", dataset_file.as_str()))
    }

    pub fn image_dir(root: &Path, image_set: ImageSet) -> PathBuf {
        root.join("images").join(match image_set {
            ImageSet::Train => "train2015",
            ImageSet::Val => "test2015",
        })
    }

    pub fn load(root: &Path, dataset_file: DatasetFile, image_set: ImageSet, num_queries: usize, num_verb_classes: usize) -> Result<Self> {
        let path = Self::annotation_file(root, dataset_file, image_set);
        let file = File::open(&path).map_err(|err| HoiError::Dataset(format!("{}: {err}", path.display())))?;
        let records: Vec<RawRecord> = serde_json::from_reader(BufReader::new(file))?;
        let image_dir = Self::image_dir(root, image_set);

        let total = records.len();
        let samples: Vec<HoiSample> = records
            .into_iter()
            .map(|record| Self::convert(record, dataset_file, &image_dir, num_verb_classes))
            .map(|mut sample| {
                if image_set == ImageSet::Train {
                    sample.hois.truncate(num_queries);
                }
                sample
            })
            .filter(|sample| image_set == ImageSet::Val || !sample.hois.is_empty())
            .collect();
        info!("{} {} images: {} of {} kept", dataset_file.as_str(), image_set.as_str(), samples.len(), total);
        Ok(Self { samples })
    }

    fn convert(record: RawRecord, dataset_file: DatasetFile, image_dir: &Path, num_verb_classes: usize) -> HoiSample {
        let mut boxes = Vec::with_capacity(record.annotations.len());
        let mut labels = Vec::with_capacity(record.annotations.len());
        // box index in the record -> index in `boxes`
        let mut remap = vec![None; record.annotations.len()];
        for (i, raw) in record.annotations.iter().enumerate() {
            if let Some(label) = coco_label(raw.category_id) {
                remap[i] = Some(boxes.len());
                boxes.push(raw.bbox);
                labels.push(label);
            }
        }

        let box_index = |id: i64| usize::try_from(id).ok().and_then(|id| remap.get(id).copied().flatten());
        let hois = record
            .hoi_annotation
            .iter()
            .filter_map(|hoi| {
                let verb = match dataset_file {
                    DatasetFile::Hico => hoi.category_id.checked_sub(1)?,
                    DatasetFile::Vcoco => hoi.category_id,
                };
                if verb >= num_verb_classes {
                    return None;
                }
                let subject = box_index(hoi.subject_id)?;
                let object = match hoi.object_id {
                    -1 if dataset_file == DatasetFile::Vcoco => None,
                    id => Some(box_index(id)?),
                };
                Some(HoiAnnotation { subject, object, verb })
            })
            .collect();

        HoiSample {
            image_path: image_dir.join(&record.file_name),
            file_name: record.file_name,
            boxes,
            labels,
            hois,
        }
    }

    /// Training instances per `(object label, verb)` category.
    pub fn triplet_counts(&self) -> HashMap<(usize, usize), usize> {
        let mut counts = HashMap::new();
        for sample in &self.samples {
            for hoi in &sample.hois {
                let Some(object) = hoi.object else { continue };
                *counts.entry((sample.labels[object], hoi.verb)).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn samples(&self) -> &[HoiSample] {
        &self.samples
    }
}

impl Dataset<HoiSample> for HoiDataset {
    fn get(&self, index: usize) -> Option<HoiSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Reads, resizes and normalizes an image into CHW order. Returns the original `[height, width]`.
pub fn load_image(path: &Path, image_size: usize) -> Result<(Vec<f32>, [usize; 2])> {
    let image = image::open(path)?;
    let orig_size = [image.height() as usize, image.width() as usize];
    let rgb = image
        .resize_exact(image_size as u32, image_size as u32, FilterType::Nearest)
        .to_rgb8();

    let plane = image_size * image_size;
    let mut values = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = y as usize * image_size + x as usize;
        for channel in 0..3 {
            let value = pixel.0[channel] as f32 / 255.0;
            values[channel * plane + offset] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }
    Ok((values, orig_size))
}

#[derive(Debug, Clone)]
pub struct HoiBatch<B: Backend> {
    /// `[N, 3, S, S]`
    pub images: Tensor<B, 4>,
    pub targets: Vec<HoiTarget>,
}

#[derive(Debug, Clone)]
pub struct HoiBatcher {
    pub image_size: usize,
    pub num_obj_classes: usize,
    pub num_verb_classes: usize,
}

impl<B: Backend> Batcher<B, HoiSample, HoiBatch<B>> for HoiBatcher {
    fn batch(&self, items: Vec<HoiSample>, device: &B::Device) -> HoiBatch<B> {
        let size = self.image_size;
        let mut pixels = Vec::with_capacity(items.len() * 3 * size * size);
        let mut targets = Vec::with_capacity(items.len());

        for item in &items {
            match load_image(&item.image_path, size) {
                Ok((values, orig_size)) => {
                    pixels.extend(values);
                    targets.push(HoiTarget::from_sample(item, orig_size, self.num_obj_classes, self.num_verb_classes));
                }
                Err(err) => warn!("skipping {}: {err}", item.image_path.display()),
            }
        }

        let images = Tensor::from_data(TensorData::new(pixels, [targets.len(), 3, size, size]), device);
        HoiBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use serde_json::json;

    use super::*;

    type TestBackend = NdArray<f32>;

    fn write_fixture(root: &Path) {
        let annotations = json!([
            {
                "file_name": "a.png",
                "annotations": [
                    { "bbox": [0.0, 0.0, 10.0, 20.0], "category_id": 1 },
                    { "bbox": [10.0, 10.0, 30.0, 20.0], "category_id": 3 },
                    { "bbox": [0.0, 0.0, 5.0, 5.0], "category_id": 12 }
                ],
                "hoi_annotation": [
                    { "subject_id": 0, "object_id": 1, "category_id": 2 },
                    { "subject_id": 0, "object_id": 1, "category_id": 5 },
                    { "subject_id": 0, "object_id": 2, "category_id": 5 },
                    { "subject_id": 0, "object_id": 7, "category_id": 5 }
                ]
            },
            {
                "file_name": "missing.png",
                "annotations": [{ "bbox": [0.0, 0.0, 4.0, 4.0], "category_id": 1 }],
                "hoi_annotation": [{ "subject_id": 0, "object_id": 0, "category_id": 1 }]
            },
            { "file_name": "empty.png", "annotations": [], "hoi_annotation": [] }
        ]);
        let annotation_dir = root.join("annotations");
        std::fs::create_dir_all(&annotation_dir).unwrap();
        for split in ["trainval_hico.json", "test_hico.json"] {
            std::fs::write(annotation_dir.join(split), annotations.to_string()).unwrap();
        }
        for split in ["train2015", "test2015"] {
            let dir = root.join("images").join(split);
            std::fs::create_dir_all(&dir).unwrap();
            RgbImage::from_pixel(40, 20, Rgb([255, 128, 0])).save(dir.join("a.png")).unwrap();
        }
    }

    #[test]
    fn coco_ids_map_to_contiguous_labels() {
        assert_eq!(coco_label(1), Some(0));
        assert_eq!(coco_label(13), Some(11));
        assert_eq!(coco_label(90), Some(79));
        assert_eq!(coco_label(12), None);
        assert_eq!(coco_label(0), None);
    }

    #[test]
    fn invalid_triplets_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let train = HoiDataset::load(dir.path(), DatasetFile::Hico, ImageSet::Train, 100, 117).unwrap();
        // the image without interactions is dropped for training
        assert_eq!(train.len(), 2);
        let first = train.get(0).unwrap();
        assert_eq!(first.labels, vec![0, 2]);
        assert_eq!(first.hois.len(), 2);
        assert_eq!(first.hois[1], HoiAnnotation { subject: 0, object: Some(1), verb: 4 });
        assert_eq!(train.triplet_counts().get(&(2, 4)), Some(&1));

        let val = HoiDataset::load(dir.path(), DatasetFile::Hico, ImageSet::Val, 100, 117).unwrap();
        assert_eq!(val.len(), 3);
    }

    #[test]
    fn training_interactions_are_capped_by_queries() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let train = HoiDataset::load(dir.path(), DatasetFile::Hico, ImageSet::Train, 1, 117).unwrap();
        assert_eq!(train.get(0).unwrap().hois.len(), 1);
    }

    #[test]
    fn targets_group_verbs_per_pair() {
        let sample = HoiSample {
            image_path: PathBuf::from("a.png"),
            file_name: "a.png".to_string(),
            boxes: vec![[0.0, 0.0, 10.0, 20.0], [10.0, 10.0, 30.0, 20.0]],
            labels: vec![0, 2],
            hois: vec![
                HoiAnnotation { subject: 0, object: Some(1), verb: 1 },
                HoiAnnotation { subject: 0, object: Some(1), verb: 3 },
                HoiAnnotation { subject: 0, object: None, verb: 0 },
            ],
        };
        let target = HoiTarget::from_sample(&sample, [20, 40], 80, 4);
        assert_eq!(target.num_pairs(), 2);
        assert_eq!(target.verb_labels[0], vec![0.0, 1.0, 0.0, 1.0]);
        assert_eq!(target.obj_labels, vec![2, 80]);
        assert_eq!(target.sub_boxes[0], [0.125, 0.5, 0.25, 1.0]);
        assert_eq!(target.obj_boxes[0], [0.5, 0.75, 0.5, 0.5]);
        assert!(target.has_object_box(0));
        assert!(!target.has_object_box(1));
    }

    #[test]
    fn batcher_skips_unreadable_images() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let train = HoiDataset::load(dir.path(), DatasetFile::Hico, ImageSet::Train, 100, 117).unwrap();
        let batcher = HoiBatcher { image_size: 16, num_obj_classes: 80, num_verb_classes: 117 };

        let batch: HoiBatch<TestBackend> = batcher.batch(train.samples().to_vec(), &Default::default());
        assert_eq!(batch.images.dims(), [1, 3, 16, 16]);
        assert_eq!(batch.targets.len(), 1);
        assert_eq!(batch.targets[0].orig_size, [20, 40]);

        let red: Vec<f32> = batch.images.narrow(1, 0, 1).into_data().iter::<f32>().collect();
        assert!(red.iter().all(|v| (v - (1.0 - 0.485) / 0.229).abs() < 1e-4));
    }
}

//! COCO-format detection dataset.

use crate::common::*;
use faster_rcnn::GtBox;
use rcnn_config::DatasetSpec;

/// The subset of a COCO annotation file used for training.
#[derive(Debug, Clone, Deserialize)]
pub struct CocoAnnotationFile {
    pub images: Vec<CocoImage>,
    pub annotations: Vec<CocoAnnotation>,
    pub categories: Vec<CocoCategory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: PathBuf,
    pub height: usize,
    pub width: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoAnnotation {
    pub image_id: u64,
    pub category_id: u64,
    /// `[x, y, w, h]` in pixels.
    pub bbox: [f64; 4],
    #[serde(default)]
    pub iscrowd: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoCategory {
    pub id: u64,
    pub name: String,
}

/// An image file and its ground truth boxes.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: HW<f64>,
    pub gt_boxes: Vec<GtBox>,
}

#[derive(Debug, Clone)]
pub struct CocoDataset {
    /// Dataset category ids in ascending order. The class of `category_ids[i]` is `i + 1`.
    pub category_ids: Vec<u64>,
    pub class_names: Vec<String>,
    pub records: Vec<Arc<FileRecord>>,
}

impl CocoDataset {
    pub async fn load(
        dataset_dir: &Path,
        split: &DatasetSpec,
        remove_images_without_annotations: bool,
    ) -> Result<Self> {
        let ann_file = dataset_dir.join(&split.ann_file);
        let image_dir = dataset_dir.join(&split.root);
        let text = tokio::fs::read_to_string(&ann_file)
            .await
            .with_context(|| format!("unable to read annotation file '{}'", ann_file.display()))?;

        let dataset = tokio::task::spawn_blocking(move || -> Result<_> {
            let file: CocoAnnotationFile = serde_json::from_str(&text)?;
            Self::from_annotations(file, &image_dir, remove_images_without_annotations)
        })
        .await??;

        info!(
            "loaded {} images with {} classes from '{}'",
            dataset.records.len(),
            dataset.num_classes(),
            ann_file.display()
        );
        Ok(dataset)
    }

    pub fn from_annotations(
        file: CocoAnnotationFile,
        image_dir: &Path,
        remove_images_without_annotations: bool,
    ) -> Result<Self> {
        let CocoAnnotationFile {
            images,
            annotations,
            categories,
        } = file;

        let categories: Vec<_> = categories
            .into_iter()
            .sorted_by_key(|category| category.id)
            .collect();
        ensure!(
            categories.iter().map(|category| category.id).all_unique(),
            "duplicated category ids"
        );
        let category_to_class: HashMap<u64, usize> = categories
            .iter()
            .enumerate()
            .map(|(index, category)| (category.id, index + 1))
            .collect();

        let mut image_boxes: HashMap<u64, Vec<GtBox>> = HashMap::new();
        let mut num_skipped = 0;

        for ann in annotations {
            let class = *category_to_class.get(&ann.category_id).ok_or_else(|| {
                format_err!(
                    "annotation refers to unknown category id {}",
                    ann.category_id
                )
            })?;

            let bbox = match Xyxy::try_from_xywh(ann.bbox) {
                Ok(bbox) if ann.iscrowd == 0 && !bbox.is_degenerate() => bbox,
                _ => {
                    num_skipped += 1;
                    continue;
                }
            };
            image_boxes
                .entry(ann.image_id)
                .or_default()
                .push(GtBox { bbox, class });
        }

        if num_skipped > 0 {
            warn!("skipped {} crowd or degenerate boxes", num_skipped);
        }

        let records: Vec<_> = images
            .into_iter()
            .filter_map(|image| {
                let gt_boxes = image_boxes.remove(&image.id).unwrap_or_default();
                if remove_images_without_annotations && gt_boxes.is_empty() {
                    return None;
                }
                let size = HW::from_hw([image.height as f64, image.width as f64]);
                let gt_boxes = gt_boxes
                    .into_iter()
                    .map(|gt| GtBox {
                        bbox: gt.bbox.clip(&size),
                        class: gt.class,
                    })
                    .filter(|gt| !gt.bbox.is_degenerate())
                    .collect_vec();
                if remove_images_without_annotations && gt_boxes.is_empty() {
                    return None;
                }

                Some(Arc::new(FileRecord {
                    path: image_dir.join(&image.file_name),
                    size,
                    gt_boxes,
                }))
            })
            .collect();
        ensure!(!records.is_empty(), "the dataset has no usable images");

        Ok(Self {
            category_ids: categories.iter().map(|category| category.id).collect(),
            class_names: categories.into_iter().map(|category| category.name).collect(),
            records,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.category_ids.len()
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }
}

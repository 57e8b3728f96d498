//! Detection results in COCO result format.

use crate::common::*;
use faster_rcnn::Detection;

/// One detection in COCO result format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub image: PathBuf,
    pub category_id: u64,
    /// `[x, y, w, h]` in original image pixels.
    pub bbox: [f64; 4],
    pub score: f64,
    /// Whether the score reaches the visualization threshold.
    pub visible: bool,
}

/// Converts the detections of an image to records, mapping 1-based classes to
/// dataset category ids when `category_ids` is given.
pub fn to_records(
    image: &Path,
    detections: &[Detection],
    category_ids: Option<&[u64]>,
    vis_threshold: f64,
) -> Result<Vec<DetectionRecord>> {
    detections
        .iter()
        .map(|detection| {
            let Detection { class, score, bbox } = *detection;
            let category_id = match category_ids {
                Some(ids) => *class
                    .checked_sub(1)
                    .and_then(|index| ids.get(index))
                    .ok_or_else(|| {
                        format_err!("class {} has no matching category id", class)
                    })?,
                None => class as u64,
            };
            let bbox = bbox.cast::<f64>().xywh();
            let score = score as f64;

            Ok(DetectionRecord {
                image: image.to_owned(),
                category_id,
                bbox,
                score,
                visible: score >= vis_threshold,
            })
        })
        .collect()
}

/// Serializes records as JSON lines.
pub fn to_json_lines(records: &[DetectionRecord]) -> Result<String> {
    let mut text = String::new();
    for record in records {
        text.push_str(&serde_json::to_string(record)?);
        text.push('\n');
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbox::Xyxy;

    fn detections() -> Vec<Detection> {
        vec![
            Detection {
                class: 1,
                score: 0.75,
                bbox: Xyxy::from_xyxy([10.0, 20.0, 40.0, 60.0]),
            },
            Detection {
                class: 3,
                score: 0.25,
                bbox: Xyxy::from_xyxy([0.0, 0.0, 5.0, 5.0]),
            },
        ]
    }

    #[test]
    fn map_category_ids() -> Result<()> {
        let records = to_records(
            Path::new("a.jpg"),
            &detections(),
            Some(&[1, 5, 90][..]),
            0.5,
        )?;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].category_id, 1);
        assert_eq!(records[0].bbox, [10.0, 20.0, 30.0, 40.0]);
        assert_eq!(records[0].score, 0.75);
        assert!(records[0].visible);
        assert_eq!(records[1].category_id, 90);
        assert!(!records[1].visible);
        Ok(())
    }

    #[test]
    fn keep_classes_without_mapping() -> Result<()> {
        let records = to_records(Path::new("a.jpg"), &detections(), None, 0.5)?;
        assert_eq!(records[1].category_id, 3);
        Ok(())
    }

    #[test]
    fn reject_unmapped_class() {
        let result = to_records(Path::new("a.jpg"), &detections(), Some(&[1, 5][..]), 0.5);
        assert!(result.is_err());
    }

    #[test]
    fn write_json_lines() -> Result<()> {
        let records = to_records(Path::new("a.jpg"), &detections(), None, 0.5)?;
        let text = to_json_lines(&records)?;
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let record: DetectionRecord = serde_json::from_str(lines[0])?;
        assert_eq!(record, records[0]);
        let value: serde_json::Value = serde_json::from_str(lines[1])?;
        assert_eq!(value["image"], "a.jpg");
        assert_eq!(value["category_id"], 3);
        Ok(())
    }
}

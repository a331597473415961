use std::collections::HashMap;

/// COCO-80 class names in model output order.
pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// COCO index of "bus".
pub const COCO_BUS: u32 = 5;

/// Class id to name lookup. Unknown ids map to `class_<id>`.
#[derive(Clone, Debug)]
pub struct ClassLabels {
    names: HashMap<u32, String>,
}

impl ClassLabels {
    pub fn coco() -> Self {
        Self::from_names(COCO_CLASSES.iter().copied())
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names
            .into_iter()
            .enumerate()
            .map(|(id, name)| (id as u32, name.into().to_lowercase()))
            .collect();
        Self { names }
    }

    pub fn name(&self, class_id: u32) -> String {
        self.names
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for ClassLabels {
    fn default() -> Self {
        Self::coco()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coco_bus_index() {
        let labels = ClassLabels::coco();
        assert_eq!(labels.name(COCO_BUS), "bus");
        assert_eq!(labels.len(), 80);
        assert_eq!(labels.name(200), "class_200");
    }

    #[test]
    fn custom_labels_are_lowercased() {
        let labels = ClassLabels::from_names(["School_Bus", "Car"]);
        assert_eq!(labels.name(0), "school_bus");
        assert_eq!(labels.name(1), "car");
    }
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Bicycle,
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleType {
    pub const ALL: [VehicleType; 5] = [
        VehicleType::Bicycle,
        VehicleType::Car,
        VehicleType::Motorcycle,
        VehicleType::Bus,
        VehicleType::Truck,
    ];

    /// Index of the class in the 80-class COCO label set.
    #[cfg(any(test, feature = "vision"))]
    pub fn coco_id(self) -> usize {
        match self {
            VehicleType::Bicycle => 1,
            VehicleType::Car => 2,
            VehicleType::Motorcycle => 3,
            VehicleType::Bus => 5,
            VehicleType::Truck => 7,
        }
    }

    #[cfg(any(test, feature = "vision"))]
    pub fn from_coco_id(id: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.coco_id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleType::Bicycle => "bicycle",
            VehicleType::Car => "car",
            VehicleType::Motorcycle => "motorcycle",
            VehicleType::Bus => "bus",
            VehicleType::Truck => "truck",
        }
    }
}

impl std::fmt::Display for VehicleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    #[cfg(any(test, feature = "vision"))]
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleDetection {
    pub vehicle_type: VehicleType,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Supplied by an upstream tracker when available; never derived here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

impl VehicleDetection {
    pub fn new(vehicle_type: VehicleType, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            vehicle_type,
            confidence,
            bbox,
            speed: None,
        }
    }

    #[cfg(test)]
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }
}

/// Running per-type totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleCounts {
    pub bicycle: u64,
    pub car: u64,
    pub motorcycle: u64,
    pub bus: u64,
    pub truck: u64,
}

impl VehicleCounts {
    pub fn add(&mut self, vehicle_type: VehicleType) {
        *self.slot(vehicle_type) += 1;
    }

    pub fn get(&self, vehicle_type: VehicleType) -> u64 {
        match vehicle_type {
            VehicleType::Bicycle => self.bicycle,
            VehicleType::Car => self.car,
            VehicleType::Motorcycle => self.motorcycle,
            VehicleType::Bus => self.bus,
            VehicleType::Truck => self.truck,
        }
    }

    pub fn total(&self) -> u64 {
        VehicleType::ALL.iter().map(|t| self.get(*t)).sum()
    }

    pub fn heavy(&self) -> u64 {
        self.bus + self.truck
    }

    pub fn from_detections<'a>(detections: impl IntoIterator<Item = &'a VehicleDetection>) -> Self {
        let mut counts = Self::default();
        for det in detections {
            counts.add(det.vehicle_type);
        }
        counts
    }

    fn slot(&mut self, vehicle_type: VehicleType) -> &mut u64 {
        match vehicle_type {
            VehicleType::Bicycle => &mut self.bicycle,
            VehicleType::Car => &mut self.car,
            VehicleType::Motorcycle => &mut self.motorcycle,
            VehicleType::Bus => &mut self.bus,
            VehicleType::Truck => &mut self.truck,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coco_mapping() {
        assert_eq!(VehicleType::from_coco_id(1), Some(VehicleType::Bicycle));
        assert_eq!(VehicleType::from_coco_id(7), Some(VehicleType::Truck));
        assert_eq!(VehicleType::from_coco_id(0), None);
        assert_eq!(VehicleType::from_coco_id(4), None);
        for t in VehicleType::ALL {
            assert_eq!(VehicleType::from_coco_id(t.coco_id()), Some(t));
        }
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        let c = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&c), 0.0);
        assert_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_inverted_box_has_no_area() {
        let b = BoundingBox::new(10.0, 10.0, 5.0, 5.0);
        assert_eq!(b.area(), 0.0);
    }

    #[test]
    fn test_counts() {
        let mut counts = VehicleCounts::default();
        counts.add(VehicleType::Car);
        counts.add(VehicleType::Car);
        counts.add(VehicleType::Truck);
        counts.add(VehicleType::Bus);
        assert_eq!(counts.get(VehicleType::Car), 2);
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.heavy(), 2);
    }

    #[test]
    fn test_serialized_names() {
        let json = serde_json::to_string(&VehicleType::Motorcycle).unwrap();
        assert_eq!(json, "\"motorcycle\"");
        let parsed: VehicleType = serde_json::from_str("\"bus\"").unwrap();
        assert_eq!(parsed, VehicleType::Bus);
    }
}

//! Traffic statistics derived from detections.
//!
//! Everything here is a pure function of the detections and counts it is
//! given, so it can be exercised without a model or a video file.

use std::collections::BTreeMap;

use serde::Serialize;

use super::vehicle::{VehicleCounts, VehicleDetection, VehicleType};
use crate::storage::DetectionZone;

pub const MODERATE_CONGESTION_RATIO: f64 = 0.10;
pub const HIGH_CONGESTION_RATIO: f64 = 0.20;
pub const HEAVY_SHARE_LIMIT: f64 = 0.30;
const SLOW_TRAFFIC_SPEED: f64 = 20.0;
const SLOW_TRAFFIC_MIN_VEHICLES: u64 = 5;
const DENSITY_WINDOW_SECS: f64 = 300.0;
const PEAK_HOUR_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CongestionLevel {
    Low,
    Moderate,
    High,
}

pub fn congestion_level(ratio: f64) -> CongestionLevel {
    if ratio < MODERATE_CONGESTION_RATIO {
        CongestionLevel::Low
    } else if ratio < HIGH_CONGESTION_RATIO {
        CongestionLevel::Moderate
    } else {
        CongestionLevel::High
    }
}

/// Summed box area over frame area. Zero for an empty frame.
pub fn congestion_ratio(detections: &[VehicleDetection], frame_width: u32, frame_height: u32) -> f64 {
    let frame_area = frame_width as f64 * frame_height as f64;
    if frame_area <= 0.0 {
        return 0.0;
    }
    let occupied: f64 = detections.iter().map(|d| d.bbox.area() as f64).sum();
    occupied / frame_area
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeedStats {
    pub average_speed: f64,
    pub speeding_vehicles: u64,
    #[serde(skip)]
    pub samples: u64,
}

/// Running speed totals; the limit is exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpeedTally {
    sum: f64,
    samples: u64,
    speeding: u64,
}

impl SpeedTally {
    pub fn add(&mut self, speed: f32, limit: f32) {
        self.sum += speed as f64;
        self.samples += 1;
        if speed > limit {
            self.speeding += 1;
        }
    }

    pub fn stats(&self) -> SpeedStats {
        let average = if self.samples > 0 {
            self.sum / self.samples as f64
        } else {
            0.0
        };
        SpeedStats {
            average_speed: round1(average),
            speeding_vehicles: self.speeding,
            samples: self.samples,
        }
    }
}

pub fn speed_stats(speeds: impl IntoIterator<Item = f32>, limit: f32) -> SpeedStats {
    let mut tally = SpeedTally::default();
    for speed in speeds {
        tally.add(speed, limit);
    }
    tally.stats()
}

/// Share of each vehicle type in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Composition {
    pub bicycle: f64,
    pub car: f64,
    pub motorcycle: f64,
    pub bus: f64,
    pub truck: f64,
}

impl Composition {
    pub fn get(&self, vehicle_type: VehicleType) -> f64 {
        match vehicle_type {
            VehicleType::Bicycle => self.bicycle,
            VehicleType::Car => self.car,
            VehicleType::Motorcycle => self.motorcycle,
            VehicleType::Bus => self.bus,
            VehicleType::Truck => self.truck,
        }
    }

    pub fn total(&self) -> f64 {
        VehicleType::ALL.iter().map(|t| self.get(*t)).sum()
    }
}

pub fn composition(counts: &VehicleCounts) -> Composition {
    let total = counts.total();
    if total == 0 {
        return Composition::default();
    }
    let pct = |t: VehicleType| counts.get(t) as f64 / total as f64 * 100.0;
    Composition {
        bicycle: pct(VehicleType::Bicycle),
        car: pct(VehicleType::Car),
        motorcycle: pct(VehicleType::Motorcycle),
        bus: pct(VehicleType::Bus),
        truck: pct(VehicleType::Truck),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RuleInputs {
    pub congestion_ratio: f64,
    pub speed: SpeedStats,
    pub counts: VehicleCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Advice {
    pub concerns: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Congestion, then speed, then composition. Order of the output follows
/// the order of the checks.
pub fn evaluate_rules(inputs: &RuleInputs) -> Advice {
    let mut advice = Advice::default();
    let congested = inputs.congestion_ratio > HIGH_CONGESTION_RATIO;
    let speeding = inputs.speed.speeding_vehicles;
    let total = inputs.counts.total();

    if congested {
        advice
            .concerns
            .push("High traffic congestion detected".to_string());
    }
    if speeding > 0 {
        advice
            .concerns
            .push(format!("{speeding} vehicles exceeding speed limit"));
    }
    if inputs.counts.heavy() as f64 / total.max(1) as f64 > HEAVY_SHARE_LIMIT {
        advice
            .concerns
            .push("High proportion of heavy vehicles".to_string());
    }

    if congested {
        advice
            .recommendations
            .push("Consider implementing traffic flow management".to_string());
    }
    if speeding > 0 {
        advice
            .recommendations
            .push("Enhance speed monitoring and enforcement".to_string());
    }
    if inputs.speed.samples > 0
        && inputs.speed.average_speed < SLOW_TRAFFIC_SPEED
        && total > SLOW_TRAFFIC_MIN_VEHICLES
    {
        advice
            .recommendations
            .push("Consider adding additional lanes or alternative routes".to_string());
    }

    advice
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameInsights {
    pub congestion_ratio: f64,
    pub congestion_level: CongestionLevel,
    pub average_speed: f64,
    pub speeding_vehicles: u64,
    pub vehicle_distribution: VehicleCounts,
    pub composition: Composition,
    pub concerns: Vec<String>,
    pub recommendations: Vec<String>,
}

pub fn analyze_frame(
    detections: &[VehicleDetection],
    frame_width: u32,
    frame_height: u32,
    speed_limit: f32,
) -> FrameInsights {
    let ratio = congestion_ratio(detections, frame_width, frame_height);
    let speed = speed_stats(detections.iter().filter_map(|d| d.speed), speed_limit);
    let counts = VehicleCounts::from_detections(detections);
    let advice = evaluate_rules(&RuleInputs {
        congestion_ratio: ratio,
        speed,
        counts,
    });

    FrameInsights {
        congestion_ratio: ratio,
        congestion_level: congestion_level(ratio),
        average_speed: speed.average_speed,
        speeding_vehicles: speed.speeding_vehicles,
        vehicle_distribution: counts,
        composition: composition(&counts),
        concerns: advice.concerns,
        recommendations: advice.recommendations,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficDensity {
    pub window_secs: u64,
    pub average: f64,
    pub maximum: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeWindow {
    pub start_secs: f64,
    pub end_secs: f64,
    pub vehicles: u64,
}

/// Result snapshot stored on a completed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub frames_analyzed: u64,
    pub vehicle_counts: VehicleCounts,
    pub total_vehicles: u64,
    pub composition: Composition,
    pub average_congestion_ratio: f64,
    pub peak_congestion_ratio: f64,
    pub congestion_level: CongestionLevel,
    pub average_speed: f64,
    pub speeding_vehicles: u64,
    pub traffic_density: TrafficDensity,
    pub busiest_window: Option<TimeWindow>,
    /// Busiest one-hour slot of video time.
    pub peak_hour: Option<TimeWindow>,
    pub zone_counts: BTreeMap<String, u64>,
    pub concerns: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Job-wide accumulator fed one frame at a time.
pub struct TrafficAggregator {
    speed_limit: f32,
    zones: Vec<DetectionZone>,
    counts: VehicleCounts,
    zone_counts: BTreeMap<String, u64>,
    frames: u64,
    ratio_sum: f64,
    peak_ratio: f64,
    speed: SpeedTally,
    windows: BTreeMap<u64, u64>,
    hours: BTreeMap<u64, u64>,
}

impl TrafficAggregator {
    pub fn new(speed_limit: f32, zones: Vec<DetectionZone>) -> Self {
        let zone_counts = zones.iter().map(|z| (z.name.clone(), 0)).collect();
        Self {
            speed_limit,
            zones,
            counts: VehicleCounts::default(),
            zone_counts,
            frames: 0,
            ratio_sum: 0.0,
            peak_ratio: 0.0,
            speed: SpeedTally::default(),
            windows: BTreeMap::new(),
            hours: BTreeMap::new(),
        }
    }

    pub fn record_frame(
        &mut self,
        timestamp_secs: f64,
        detections: &[VehicleDetection],
        frame_width: u32,
        frame_height: u32,
    ) -> FrameInsights {
        self.frames += 1;

        let insights = analyze_frame(detections, frame_width, frame_height, self.speed_limit);
        self.ratio_sum += insights.congestion_ratio;
        self.peak_ratio = self.peak_ratio.max(insights.congestion_ratio);

        for det in detections {
            self.counts.add(det.vehicle_type);
            if let Some(speed) = det.speed {
                self.speed.add(speed, self.speed_limit);
            }

            let (cx, cy) = det.bbox.center();
            let nx = cx / frame_width.max(1) as f32;
            let ny = cy / frame_height.max(1) as f32;
            for zone in &self.zones {
                if zone.contains(nx, ny) {
                    *self.zone_counts.entry(zone.name.clone()).or_insert(0) += 1;
                }
            }
        }

        if !detections.is_empty() {
            let at = timestamp_secs.max(0.0);
            let seen = detections.len() as u64;
            *self.windows.entry((at / DENSITY_WINDOW_SECS) as u64).or_insert(0) += seen;
            *self.hours.entry((at / PEAK_HOUR_SECS) as u64).or_insert(0) += seen;
        }

        insights
    }

    pub fn counts(&self) -> VehicleCounts {
        self.counts
    }

    pub fn summary(&self) -> AnalysisSummary {
        let average_ratio = if self.frames > 0 {
            self.ratio_sum / self.frames as f64
        } else {
            0.0
        };
        let speed = self.speed.stats();
        let advice = evaluate_rules(&RuleInputs {
            congestion_ratio: average_ratio,
            speed,
            counts: self.counts,
        });

        let window_total: u64 = self.windows.values().sum();
        let density = TrafficDensity {
            window_secs: DENSITY_WINDOW_SECS as u64,
            average: if self.windows.is_empty() {
                0.0
            } else {
                window_total as f64 / self.windows.len() as f64
            },
            maximum: self.windows.values().copied().max().unwrap_or(0),
        };


        AnalysisSummary {
            frames_analyzed: self.frames,
            vehicle_counts: self.counts,
            total_vehicles: self.counts.total(),
            composition: composition(&self.counts),
            average_congestion_ratio: average_ratio,
            peak_congestion_ratio: self.peak_ratio,
            congestion_level: congestion_level(average_ratio),
            average_speed: speed.average_speed,
            speeding_vehicles: speed.speeding_vehicles,
            traffic_density: density,
            busiest_window: busiest(&self.windows, DENSITY_WINDOW_SECS),
            peak_hour: busiest(&self.hours, PEAK_HOUR_SECS),
            zone_counts: self.zone_counts.clone(),
            concerns: advice.concerns,
            recommendations: advice.recommendations,
        }
    }
}

/// Slot with the most detections; the earliest wins a tie.
fn busiest(slots: &BTreeMap<u64, u64>, slot_secs: f64) -> Option<TimeWindow> {
    slots
        .iter()
        .fold(None::<(u64, u64)>, |best, (&slot, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((slot, count)),
        })
        .map(|(slot, vehicles)| TimeWindow {
            start_secs: slot as f64 * slot_secs,
            end_secs: (slot + 1) as f64 * slot_secs,
            vehicles,
        })
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

//! Wire message types (JSON, field-exact).
//!
//! These structs mirror the published schemas byte for byte; everything else
//! in the crate works on the model types and converts at the boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::body::{Human, Robot};
use crate::core::{Mode, Point3, TimestampType};
use crate::error::Result;

/// Announces a body entering the workcell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyPresentationMessage {
    pub id: String,
    pub is_human: bool,
    pub segment_pairs: Vec<(u16, u16)>,
    pub thicknesses: Vec<f64>,
    /// Required for robots: expected state message frequency (Hz).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_frequency: Option<f64>,
    /// Optional keypoint names; indices are used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point_ids: Option<Vec<String>>,
}

impl BodyPresentationMessage {
    /// Build the human descriptor announced by this presentation.
    pub fn to_human(&self) -> Result<Human> {
        Human::new(
            self.id.clone(),
            &self.segment_pairs,
            &self.thicknesses,
            self.point_ids.as_deref(),
        )
    }

    /// Build the robot descriptor announced by this presentation.
    pub fn to_robot(&self) -> Result<Robot> {
        Robot::new(
            self.id.clone(),
            self.message_frequency.unwrap_or(0.0),
            &self.segment_pairs,
            &self.thicknesses,
            self.point_ids.as_deref(),
        )
    }
}

/// A human sample: candidate positions per keypoint, per body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanStateMessage {
    pub timestamp: TimestampType,
    /// body id -> keypoint id -> candidate positions.
    pub bodies: BTreeMap<String, BTreeMap<String, Vec<[f64; 3]>>>,
}

/// A robot sample: current mode and one point list per keypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotStateMessage {
    pub timestamp: TimestampType,
    pub mode: Mode,
    /// Outer index is the keypoint; the inner list is usually length 1.
    pub points: Vec<Vec<[f64; 3]>>,
}

impl RobotStateMessage {
    /// Collapse the per-keypoint candidate lists to single points
    /// (averaging, matching the human-side candidate handling).
    pub fn keypoint_points(&self) -> Vec<Option<Point3>> {
        self.points
            .iter()
            .map(|candidates| {
                let pts: Vec<Point3> = candidates
                    .iter()
                    .map(|c| Point3::from(*c))
                    .filter(|p| p.is_finite())
                    .collect();
                Point3::centroid(&pts)
            })
            .collect()
    }
}

/// Predicted time-to-collision bounds, in integer nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionDistance {
    pub lower: u64,
    pub upper: u64,
}

/// A published collision prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionNotificationMessage {
    pub human_id: String,
    pub human_segment: (u16, u16),
    pub human_segment_id: u16,
    pub robot_id: String,
    pub robot_segment_id: u16,
    pub current_time: TimestampType,
    pub collision_distance: CollisionDistance,
    /// Confidence of the prediction in `[0, 1]`.
    pub likelihood: f64,
    pub mode: Mode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presentation_round_trip() {
        let json = r#"{
            "id": "r0",
            "is_human": false,
            "segment_pairs": [[0,1],[1,2]],
            "thicknesses": [0.1, 0.08],
            "message_frequency": 20.0
        }"#;
        let msg: BodyPresentationMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.segment_pairs, vec![(0, 1), (1, 2)]);
        let robot = msg.to_robot().unwrap();
        assert_eq!(robot.num_points(), 3);

        let back = serde_json::to_string(&msg).unwrap();
        let again: BodyPresentationMessage = serde_json::from_str(&back).unwrap();
        assert_eq!(msg, again);
    }

    #[test]
    fn test_robot_without_frequency_is_rejected() {
        let msg = BodyPresentationMessage {
            id: "r0".to_string(),
            is_human: false,
            segment_pairs: vec![(0, 1)],
            thicknesses: vec![0.1],
            message_frequency: None,
            point_ids: None,
        };
        assert!(msg.to_robot().is_err());
    }

    #[test]
    fn test_human_state_candidates() {
        let json = r#"{
            "timestamp": 1000000000,
            "bodies": {
                "h0": { "0": [[0.1, 0.2, 0.3], [0.11, 0.21, 0.31]], "1": [[1.0, 1.0, 1.0]] }
            }
        }"#;
        let msg: HumanStateMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.bodies["h0"]["0"].len(), 2);
    }

    #[test]
    fn test_robot_state_mode_normalisation() {
        let json = r#"{
            "timestamp": 5,
            "mode": { "phase": 3 },
            "points": [[[0.0, 0.0, 0.0]], [[1.0, 0.0, 0.0]]]
        }"#;
        let msg: RobotStateMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.mode.is_empty());
        let points = msg.keypoint_points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].unwrap(), Point3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_notification_serialises_exact_fields() {
        let msg = CollisionNotificationMessage {
            human_id: "h0".to_string(),
            human_segment: (4, 5),
            human_segment_id: 2,
            robot_id: "r0".to_string(),
            robot_segment_id: 7,
            current_time: 1_000_000_000,
            collision_distance: CollisionDistance {
                lower: 100_000_000,
                upper: 200_000_000,
            },
            likelihood: 0.5,
            mode: Mode::from_pairs([("phase", "3")]),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(value["human_segment"], serde_json::json!([4, 5]));
        assert_eq!(value["collision_distance"]["lower"], 100_000_000);
        assert_eq!(value["mode"]["phase"], "3");
    }
}

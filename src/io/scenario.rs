//! Scenario resources: JSON fixtures for replay and comparison drivers.
//!
//! Layout mirrors the recorded datasets:
//! `resources/<scenario_type>/<role>/presentation.json` and
//! `resources/<scenario_type>/<role>/<scenario_key>/<N>.json`, numbered from
//! zero. Collected notifications are written to
//! `collisions/<scenario_type>/<scenario_key>/<N>.json`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::TimestampType;
use crate::error::Result;

use super::messages::{
    BodyPresentationMessage, CollisionNotificationMessage, HumanStateMessage, RobotStateMessage,
};

/// Either kind of state message, for timestamp-ordered interleaving.
#[derive(Debug, Clone)]
pub enum BodyStateEvent {
    Human(HumanStateMessage),
    Robot(RobotStateMessage),
}

impl BodyStateEvent {
    pub fn timestamp(&self) -> TimestampType {
        match self {
            BodyStateEvent::Human(m) => m.timestamp,
            BodyStateEvent::Robot(m) => m.timestamp,
        }
    }
}

/// Accessor for one scenario's files under a resources root.
#[derive(Debug, Clone)]
pub struct ScenarioResources {
    root: PathBuf,
    scenario_type: String,
    scenario_key: String,
}

impl ScenarioResources {
    pub fn new(
        root: impl Into<PathBuf>,
        scenario_type: impl Into<String>,
        scenario_key: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            scenario_type: scenario_type.into(),
            scenario_key: scenario_key.into(),
        }
    }

    fn role_dir(&self, role: &str) -> PathBuf {
        self.root.join(&self.scenario_type).join(role)
    }

    fn state_path(&self, role: &str, index: usize) -> PathBuf {
        self.role_dir(role)
            .join(&self.scenario_key)
            .join(format!("{}.json", index))
    }

    /// Load `presentation.json` for a role (`human` or `robot`).
    pub fn load_presentation(&self, role: &str) -> Result<BodyPresentationMessage> {
        let path = self.role_dir(role).join("presentation.json");
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Load the numbered human state messages, stopping at the first gap.
    pub fn load_human_states(&self) -> Result<Vec<HumanStateMessage>> {
        let mut result = Vec::new();
        for index in 0.. {
            let path = self.state_path("human", index);
            if !path.exists() {
                break;
            }
            let contents = fs::read_to_string(&path)?;
            result.push(serde_json::from_str(&contents)?);
        }
        Ok(result)
    }

    /// Load the numbered robot state messages, stopping at the first gap.
    pub fn load_robot_states(&self) -> Result<Vec<RobotStateMessage>> {
        let mut result = Vec::new();
        for index in 0.. {
            let path = self.state_path("robot", index);
            if !path.exists() {
                break;
            }
            let contents = fs::read_to_string(&path)?;
            result.push(serde_json::from_str(&contents)?);
        }
        Ok(result)
    }

    /// Load every state message of the scenario, interleaved by timestamp
    /// (human first on ties, matching recorded playback).
    pub fn load_state_events(&self) -> Result<Vec<BodyStateEvent>> {
        let humans = self.load_human_states()?;
        let robots = self.load_robot_states()?;

        let mut result = Vec::with_capacity(humans.len() + robots.len());
        let mut human_it = humans.into_iter().peekable();
        let mut robot_it = robots.into_iter().peekable();
        loop {
            match (human_it.peek(), robot_it.peek()) {
                (None, None) => break,
                (Some(_), None) => result.push(BodyStateEvent::Human(human_it.next().unwrap())),
                (None, Some(_)) => result.push(BodyStateEvent::Robot(robot_it.next().unwrap())),
                (Some(h), Some(r)) => {
                    if h.timestamp > r.timestamp {
                        result.push(BodyStateEvent::Robot(robot_it.next().unwrap()));
                    } else {
                        result.push(BodyStateEvent::Human(human_it.next().unwrap()));
                    }
                }
            }
        }
        Ok(result)
    }

    /// Write collected notifications under `collisions/<type>/<key>/`.
    pub fn save_collisions(
        &self,
        output_root: &Path,
        collisions: &[CollisionNotificationMessage],
    ) -> Result<()> {
        let dir = output_root
            .join(&self.scenario_type)
            .join(&self.scenario_key);
        fs::create_dir_all(&dir)?;
        for (index, message) in collisions.iter().enumerate() {
            let path = dir.join(format!("{}.json", index));
            fs::write(path, serde_json::to_string_pretty(message)?)?;
        }
        Ok(())
    }
}

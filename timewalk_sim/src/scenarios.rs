//! Cross-session scenarios for DST.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DST-001: photo registered in one session, found from another marker in a second session
    CrossSession,

    /// DST-002: long marker chain resolved from its far end
    ChainResolve,

    /// DST-003: viewer pacing across the geofence edge
    Hysteresis,

    /// DST-004: viewer turning in place behind an avatar
    FacingSweep,

    /// DST-005: camera panning past an off-screen avatar
    GuideSweep,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::CrossSession,
            ScenarioId::ChainResolve,
            ScenarioId::Hysteresis,
            ScenarioId::FacingSweep,
            ScenarioId::GuideSweep,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::CrossSession => "cross_session",
            ScenarioId::ChainResolve => "chain_resolve",
            ScenarioId::Hysteresis => "hysteresis",
            ScenarioId::FacingSweep => "facing_sweep",
            ScenarioId::GuideSweep => "guide_sweep",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::CrossSession => {
                "Device A links two markers, device B places A's photo from the other marker"
            }
            ScenarioId::ChainResolve => "Six-marker chain, photos resolved from the last marker only",
            ScenarioId::Hysteresis => "Viewer oscillates on the geofence edge, no flicker under 500ms",
            ScenarioId::FacingSweep => "Viewer turns a full circle, reveal only inside the facing cone",
            ScenarioId::GuideSweep => "Camera pans 360 degrees, guide stays on-screen and consistent",
        }
    }

    /// Scenarios that hand tracking events through a channel instead of
    /// calling the session directly.
    pub fn uses_channel(&self) -> bool {
        matches!(self, ScenarioId::CrossSession)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cross_session" | "crosssession" | "dst-001" => Ok(ScenarioId::CrossSession),
            "chain_resolve" | "chainresolve" | "chain" | "dst-002" => Ok(ScenarioId::ChainResolve),
            "hysteresis" | "dst-003" => Ok(ScenarioId::Hysteresis),
            "facing_sweep" | "facingsweep" | "facing" | "dst-004" => Ok(ScenarioId::FacingSweep),
            "guide_sweep" | "guidesweep" | "guide" | "dst-005" => Ok(ScenarioId::GuideSweep),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_names_parse_back() {
        for scenario in ScenarioId::all() {
            let parsed: ScenarioId = scenario.name().parse().unwrap();
            assert_eq!(parsed, scenario);
        }
    }

    #[test]
    fn test_scenario_aliases() {
        assert_eq!("DST-003".parse::<ScenarioId>(), Ok(ScenarioId::Hysteresis));
        assert_eq!("guide".parse::<ScenarioId>(), Ok(ScenarioId::GuideSweep));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}

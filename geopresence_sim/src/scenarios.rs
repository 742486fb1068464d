//! Fault-injection scenarios for the presence client.

/// Scenario identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// connect, drop, reconnect, deactivate: exact transition sequence
    StateFidelity,

    /// Repeated drop/reconnect flaps, none coalesced
    Flapping,

    /// Reconnect attempts exhausted, then manual re-activation
    GiveUp,

    /// Sends outside Connected never reach the transport
    SendGating,

    /// Frames racing a deactivate never touch the view
    TeardownRace,

    /// Seeded burst of updates over a handful of identities
    MergeBurst,

    /// Many activate/deactivate cycles without leaking sockets
    ActivationCycles,

    /// Garbage on the wire is dropped without disturbing the snapshot
    MalformedFrames,
}

impl ScenarioId {
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::StateFidelity,
            ScenarioId::Flapping,
            ScenarioId::GiveUp,
            ScenarioId::SendGating,
            ScenarioId::TeardownRace,
            ScenarioId::MergeBurst,
            ScenarioId::ActivationCycles,
            ScenarioId::MalformedFrames,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::StateFidelity => "state_fidelity",
            ScenarioId::Flapping => "flapping",
            ScenarioId::GiveUp => "give_up",
            ScenarioId::SendGating => "send_gating",
            ScenarioId::TeardownRace => "teardown_race",
            ScenarioId::MergeBurst => "merge_burst",
            ScenarioId::ActivationCycles => "activation_cycles",
            ScenarioId::MalformedFrames => "malformed_frames",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::StateFidelity => "Connecting→Connected→Reconnecting→Connected→Disconnected, nothing skipped",
            ScenarioId::Flapping => "10 transport drops in a row, every Reconnecting/Connected observed",
            ScenarioId::GiveUp => "hub refuses every reconnect until the policy gives up",
            ScenarioId::SendGating => "send while Idle, Reconnecting, Disconnected makes no transport call",
            ScenarioId::TeardownRace => "positions in flight during deactivate are ignored",
            ScenarioId::MergeBurst => "500 seeded updates over 16 identities, upsert order preserved",
            ScenarioId::ActivationCycles => "50 activate/deactivate cycles, zero sockets left open",
            ScenarioId::MalformedFrames => "bad JSON, wrong arity, wrong types; off-range values are kept",
        }
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
        match s.to_lowercase().replace('-', "_").as_str() {
            "state_fidelity" | "fidelity" => Ok(ScenarioId::StateFidelity),
            "flapping" | "flap" => Ok(ScenarioId::Flapping),
            "give_up" | "giveup" => Ok(ScenarioId::GiveUp),
            "send_gating" | "gating" => Ok(ScenarioId::SendGating),
            "teardown_race" | "teardown" => Ok(ScenarioId::TeardownRace),
            "merge_burst" | "burst" => Ok(ScenarioId::MergeBurst),
            "activation_cycles" | "cycles" => Ok(ScenarioId::ActivationCycles),
            "malformed_frames" | "malformed" => Ok(ScenarioId::MalformedFrames),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("Give-Up".parse::<ScenarioId>(), Ok(ScenarioId::GiveUp));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}

//! Session phase, game mode and round outcome.

wire_tag! {
    /// Shared screen/phase of a session. The host is the only authority.
    pub enum SessionPhase {
        /// Waiting room before a campaign.
        Lobby = 0 => "lobby",
        /// Host is choosing (or has announced) the game mode.
        ModeSelect = 1 => "mode_select",
        /// Pre-round briefing; full sync happens here.
        Briefing = 2 => "briefing",
        /// Simulation running, snapshots flowing.
        Playing = 3 => "playing",
        /// Round finished, outcome known.
        RoundEnd = 4 => "round_end",
        /// Spending resources between rounds.
        Upgrade = 5 => "upgrade",
    }
}

impl Default for SessionPhase {
    fn default() -> Self {
        Self::Lobby
    }
}

wire_tag! {
    /// Game mode announced by the host in `modeSelect`.
    pub enum GameMode {
        /// Both players work toward one objective.
        Coop = 0 => "coop",
        /// Players compete on score.
        Versus = 1 => "versus",
        /// One player pursues, the other flees.
        Chase = 2 => "chase",
    }
}

wire_tag! {
    /// Result of a round as decided by the host simulation.
    pub enum RoundOutcome {
        /// Advance to the upgrade phase (or finish the campaign).
        Success = 0 => "success",
        /// Retry the same round from a fresh briefing.
        Failure = 1 => "failure",
    }
}

//! Player commands, applied in submission order at the start of a tick.

use super::Simulation;
use crate::command::{CommandOutcome, ConvoyCommand};
use crate::convoy::Convoy;
use crate::error::{Result, SimError};
use crate::events::SimEvent;
use crate::state::ConvoyState;
use crate::world::WorldContext;
use convoy_domain::{ConvoyId, LineId};
use tracing::{info, warn};

fn invalid(convoy: ConvoyId, reason: impl Into<String>) -> SimError {
    SimError::InvalidCommand {
        convoy,
        reason: reason.into(),
    }
}

impl Simulation {
    pub(crate) fn apply_commands(&mut self, ctx: &WorldContext<'_>) -> Vec<CommandOutcome> {
        let mut outcomes = Vec::with_capacity(self.commands.len());
        while let Some((convoy, command)) = self.commands.pop_front() {
            let name = command.as_str();
            let result = self.apply_command(convoy, command, ctx);
            if let Err(err) = &result {
                warn!(%convoy, command = name, error = %err, "Command rejected");
                self.emit(SimEvent::CommandRejected {
                    convoy,
                    reason: err.to_string(),
                });
            }
            outcomes.push(CommandOutcome {
                convoy,
                command: name,
                result,
            });
        }
        outcomes
    }

    fn apply_command(&mut self, convoy: ConvoyId, command: ConvoyCommand, ctx: &WorldContext<'_>) -> Result<()> {
        if !self.convoys.is_live(convoy) {
            return Err(invalid(convoy, "convoy no longer exists"));
        }
        let follower = self.couplings.leader_of(convoy).is_some();
        if follower && steers(&command) {
            return Err(invalid(convoy, "a coupled follower goes where its leader goes"));
        }
        match command {
            ConvoyCommand::Couple { leader } => self.couple_convoi(convoy, leader, ctx),
            ConvoyCommand::Uncouple => self.uncouple_convoi(convoy, ctx),
            ConvoyCommand::SetLine { line } => self.set_line(convoy, line),
            other => {
                let mut cnv = self
                    .convoys
                    .take(convoy)
                    .ok_or(SimError::InvalidHandle(convoy))?;
                let result = self.apply_to(&mut cnv, other);
                self.convoys.put_back(convoy, cnv);
                result
            }
        }
    }

    fn apply_to(&mut self, cnv: &mut Convoy, command: ConvoyCommand) -> Result<()> {
        match command {
            ConvoyCommand::Start => {
                if !matches!(cnv.state, ConvoyState::Initial | ConvoyState::EditSchedule) {
                    return Err(invalid(cnv.id, format!("cannot start while {}", cnv.state)));
                }
                self.reroute(cnv);
            }
            ConvoyCommand::EditSchedule => {
                if matches!(cnv.state, ConvoyState::Initial | ConvoyState::SelfDestruct) {
                    return Err(invalid(cnv.id, format!("cannot edit the schedule while {}", cnv.state)));
                }
                cnv.kin.akt_speed = 0;
                self.transition(cnv, ConvoyState::EditSchedule);
            }
            ConvoyCommand::SetSchedule { schedule } => {
                if schedule.is_empty() {
                    return Err(invalid(cnv.id, "empty schedule"));
                }
                if let Some(line) = cnv.line.take() {
                    self.lines.detach(line, cnv.id);
                }
                cnv.schedule = schedule;
                cnv.scheduled_departure_tick = None;
                cnv.departed_tick = None;
                cnv.in_delay_recovery = false;
                if cnv.state != ConvoyState::Initial {
                    self.reroute(cnv);
                }
            }
            ConvoyCommand::RecalculateRoute => {
                if matches!(cnv.state, ConvoyState::Initial | ConvoyState::SelfDestruct) {
                    return Err(invalid(cnv.id, format!("nothing to recalculate while {}", cnv.state)));
                }
                self.reroute(cnv);
            }
            ConvoyCommand::SendToDepot => {
                if cnv.in_depot() {
                    return Err(invalid(cnv.id, "already in the depot"));
                }
                cnv.heading_home = true;
                self.reroute(cnv);
            }
            ConvoyCommand::Withdraw { enabled } => {
                cnv.withdraw = enabled;
                if enabled {
                    cnv.no_load = true;
                    if cnv.in_depot() {
                        self.transition(cnv, ConvoyState::SelfDestruct);
                    } else {
                        cnv.heading_home = true;
                        self.reroute(cnv);
                    }
                }
            }
            ConvoyCommand::NoLoad { enabled } => cnv.no_load = enabled,
            ConvoyCommand::Sell => {
                if !cnv.in_depot() {
                    return Err(invalid(cnv.id, "only convoys in the depot can be sold"));
                }
                let value = cnv.calc_restwert();
                info!(convoy = %cnv.id, value, "Convoy sold");
                self.emit(SimEvent::Sold {
                    convoy: cnv.id,
                    owner: cnv.owner,
                    value,
                });
                self.transition(cnv, ConvoyState::SelfDestruct);
            }
            ConvoyCommand::SelfDestruct => self.transition(cnv, ConvoyState::SelfDestruct),
            ConvoyCommand::RequestTrade { to } => {
                if to == cnv.owner {
                    return Err(invalid(cnv.id, "trade with the current owner"));
                }
                cnv.permit_trade = true;
                cnv.accept_player_nr = Some(to);
            }
            ConvoyCommand::AcceptTrade { player } => {
                if !cnv.permit_trade || cnv.accept_player_nr != Some(player) {
                    return Err(invalid(cnv.id, format!("no trade offered to player {}", player.0)));
                }
                let from = cnv.owner;
                cnv.owner = player;
                cnv.permit_trade = false;
                cnv.accept_player_nr = None;
                info!(convoy = %cnv.id, from = from.0, to = player.0, "Owner changed");
                self.emit(SimEvent::OwnerChanged {
                    convoy: cnv.id,
                    from,
                    to: player,
                });
            }
            ConvoyCommand::Couple { .. } | ConvoyCommand::Uncouple | ConvoyCommand::SetLine { .. } => {
                return Err(invalid(cnv.id, "command routed to the wrong handler"));
            }
        }
        Ok(())
    }

    /// Ask for a fresh route on the convoy's next step.
    fn reroute(&mut self, cnv: &mut Convoy) {
        cnv.wait_lock = 0;
        self.transition(cnv, ConvoyState::Routing);
    }

    fn set_line(&mut self, convoy: ConvoyId, line: Option<LineId>) -> Result<()> {
        if let Some(id) = line {
            if self.lines.get(id).is_none() {
                return Err(invalid(convoy, format!("unknown line {}", id.0)));
            }
        }
        let mut cnv = self
            .convoys
            .take(convoy)
            .ok_or(SimError::InvalidHandle(convoy))?;
        if let Some(old) = cnv.line.take() {
            self.lines.detach(old, convoy);
        }
        if let Some(schedule) = line.and_then(|id| self.lines.attach(id, convoy)) {
            cnv.line = line;
            cnv.schedule = schedule;
            if !matches!(cnv.state, ConvoyState::Initial | ConvoyState::SelfDestruct) {
                self.reroute(&mut cnv);
            }
        }
        self.convoys.put_back(convoy, cnv);
        Ok(())
    }
}

/// Commands that change where a convoy goes.
const fn steers(command: &ConvoyCommand) -> bool {
    matches!(
        command,
        ConvoyCommand::Start
            | ConvoyCommand::EditSchedule
            | ConvoyCommand::SetSchedule { .. }
            | ConvoyCommand::RecalculateRoute
            | ConvoyCommand::SendToDepot
            | ConvoyCommand::Withdraw { enabled: true }
            | ConvoyCommand::SetLine { .. }
            | ConvoyCommand::Couple { .. }
    )
}

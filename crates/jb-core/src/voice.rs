//! Voice-channel chaperone.
//!
//! Each voice channel has its own state behind its own lock. A roster change
//! is applied and the Safe/Muted transition computed while holding that lock;
//! the resulting platform calls (mute, unmute, alert) run after it is released.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    directory::Moderators,
    domain::{AgeCategory, ChannelId, MemberId},
    formatting,
    messaging::{port::PlatformPort, types::RosterMember},
    Error, Result,
};

/// One observed change to a voice channel's occupancy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RosterDelta {
    Joined {
        member: MemberId,
        #[serde(default)]
        category: AgeCategory,
    },
    Left {
        member: MemberId,
    },
    CategoryKnown {
        member: MemberId,
        category: AgeCategory,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SafetyPhase {
    #[default]
    Safe,
    /// `muted` is exactly the set this monitor muted and still owes an unmute.
    Muted { muted: BTreeSet<MemberId> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoiceChannelState {
    pub channel: ChannelId,
    pub roster: BTreeMap<MemberId, AgeCategory>,
    pub phase: SafetyPhase,
    pub alert_sent: bool,
}

/// Platform calls produced by one transition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SafetyEffects {
    pub mute: Vec<MemberId>,
    pub unmute: Vec<MemberId>,
    /// `(adult, child)` when a moderator alert is due.
    pub alert: Option<(MemberId, MemberId)>,
}

impl SafetyEffects {
    pub fn is_empty(&self) -> bool {
        self.mute.is_empty() && self.unmute.is_empty() && self.alert.is_none()
    }
}

impl VoiceChannelState {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            roster: BTreeMap::new(),
            phase: SafetyPhase::Safe,
            alert_sent: false,
        }
    }

    pub fn mute_active(&self) -> bool {
        matches!(self.phase, SafetyPhase::Muted { .. })
    }

    /// The lone adult and lone child, if that is exactly the Adult/Child
    /// population. Unknown-age members do not count either way.
    pub fn lone_pair(&self) -> Option<(MemberId, MemberId)> {
        let mut adults = self
            .roster
            .iter()
            .filter(|(_, c)| **c == AgeCategory::Adult)
            .map(|(m, _)| *m);
        let mut children = self
            .roster
            .iter()
            .filter(|(_, c)| **c == AgeCategory::Child)
            .map(|(m, _)| *m);

        match (adults.next(), adults.next(), children.next(), children.next()) {
            (Some(adult), None, Some(child), None) => Some((adult, child)),
            _ => None,
        }
    }

    /// Apply a delta to the roster. A delta that contradicts the roster
    /// (duplicate join, unknown member) is rejected and leaves it untouched.
    pub fn apply(&mut self, delta: &RosterDelta) -> Result<()> {
        match *delta {
            RosterDelta::Joined { member, category } => {
                if self.roster.contains_key(&member) {
                    return Err(self.inconsistency(format!("member {member} joined twice")));
                }
                self.roster.insert(member, category);
            }
            RosterDelta::Left { member } => {
                if self.roster.remove(&member).is_none() {
                    return Err(self.inconsistency(format!("unknown member {member} left")));
                }
            }
            RosterDelta::CategoryKnown { member, category } => {
                if !self.roster.contains_key(&member) {
                    return Err(
                        self.inconsistency(format!("category for unknown member {member}"))
                    );
                }
                self.roster.insert(member, category);
            }
        }
        Ok(())
    }

    pub fn replace_roster(&mut self, members: impl IntoIterator<Item = RosterMember>) {
        self.roster = members
            .into_iter()
            .map(|m| (m.member, m.category))
            .collect();
    }

    /// Move the state machine to match the roster.
    pub fn evaluate(&mut self) -> SafetyEffects {
        let pair = self.lone_pair();
        match (std::mem::take(&mut self.phase), pair) {
            (SafetyPhase::Safe, Some((adult, child))) => {
                self.phase = SafetyPhase::Muted {
                    muted: BTreeSet::from([adult, child]),
                };
                self.alert_sent = true;
                SafetyEffects {
                    mute: vec![adult, child],
                    unmute: Vec::new(),
                    alert: Some((adult, child)),
                }
            }
            (SafetyPhase::Muted { muted }, Some((adult, child))) => {
                // Still triggered. Only a swapped pair (seen after a roster
                // resync) needs work, and it does not alert again.
                let wanted = BTreeSet::from([adult, child]);
                let effects = SafetyEffects {
                    mute: wanted.difference(&muted).copied().collect(),
                    unmute: muted.difference(&wanted).copied().collect(),
                    alert: None,
                };
                self.phase = SafetyPhase::Muted { muted: wanted };
                effects
            }
            (SafetyPhase::Muted { muted }, None) => {
                self.alert_sent = false;
                SafetyEffects {
                    unmute: muted.into_iter().collect(),
                    ..SafetyEffects::default()
                }
            }
            (SafetyPhase::Safe, None) => {
                if self.roster.is_empty() {
                    self.alert_sent = false;
                }
                SafetyEffects::default()
            }
        }
    }

    /// Leave `Muted` unconditionally, unmuting everyone this monitor muted.
    pub fn lift(&mut self) -> SafetyEffects {
        let phase = std::mem::take(&mut self.phase);
        self.alert_sent = false;
        match phase {
            SafetyPhase::Muted { muted } => SafetyEffects {
                unmute: muted.into_iter().collect(),
                ..SafetyEffects::default()
            },
            SafetyPhase::Safe => SafetyEffects::default(),
        }
    }

    fn inconsistency(&self, detail: String) -> Error {
        Error::RosterInconsistency {
            channel: self.channel.0,
            detail,
        }
    }
}

pub struct VoiceSafetyMonitor {
    platform: Arc<dyn PlatformPort>,
    moderators: Arc<Moderators>,
    channels: StdMutex<HashMap<ChannelId, Arc<Mutex<VoiceChannelState>>>>,
    lock_timeout: Duration,
    enabled: AtomicBool,
}

impl VoiceSafetyMonitor {
    pub fn new(
        platform: Arc<dyn PlatformPort>,
        moderators: Arc<Moderators>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            platform,
            moderators,
            channels: StdMutex::new(HashMap::new()),
            lock_timeout,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn on_roster_changed(
        &self,
        channel: ChannelId,
        delta: RosterDelta,
    ) -> Result<SafetyEffects> {
        let cell = self.cell(channel);
        let mut state = self.lock_state(&cell, channel).await?;

        if let Err(e) = state.apply(&delta) {
            tracing::warn!(channel = %channel, error = %e, "roster out of sync, re-reading");
            drop(state);
            let roster = self.platform.voice_roster(channel).await?;
            state = self.lock_state(&cell, channel).await?;
            state.replace_roster(roster);
        }

        let effects = if self.is_enabled() {
            state.evaluate()
        } else {
            SafetyEffects::default()
        };
        drop(state);

        self.execute(channel, &effects).await;
        Ok(effects)
    }

    /// Turn the chaperone on or off. Disabling lifts every active mute;
    /// enabling re-evaluates every known channel. Returns how many channels
    /// changed.
    pub async fn set_enabled(&self, enabled: bool) -> usize {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        tracing::info!(enabled, was, "voice chaperone toggled");

        let cells: Vec<_> = self
            .lock_channels()
            .iter()
            .map(|(id, cell)| (*id, cell.clone()))
            .collect();

        let mut changed = 0;
        for (channel, cell) in cells {
            let effects = match self.lock_state(&cell, channel).await {
                Ok(mut state) if enabled => state.evaluate(),
                Ok(mut state) => state.lift(),
                Err(e) => {
                    tracing::error!(channel = %channel, error = %e, "skipping channel during toggle");
                    continue;
                }
            };
            if !effects.is_empty() {
                changed += 1;
                self.execute(channel, &effects).await;
            }
        }
        changed
    }

    pub async fn snapshot(&self, channel: ChannelId) -> Option<VoiceChannelState> {
        let cell = self.lock_channels().get(&channel).cloned()?;
        let state = cell.lock().await;
        Some(state.clone())
    }

    fn cell(&self, channel: ChannelId) -> Arc<Mutex<VoiceChannelState>> {
        self.lock_channels()
            .entry(channel)
            .or_insert_with(|| Arc::new(Mutex::new(VoiceChannelState::new(channel))))
            .clone()
    }

    fn lock_channels(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ChannelId, Arc<Mutex<VoiceChannelState>>>> {
        self.channels.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Bounded wait, retried once.
    async fn lock_state(
        &self,
        cell: &Arc<Mutex<VoiceChannelState>>,
        channel: ChannelId,
    ) -> Result<OwnedMutexGuard<VoiceChannelState>> {
        for attempt in 1..=2 {
            match tokio::time::timeout(self.lock_timeout, cell.clone().lock_owned()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => {
                    tracing::warn!(channel = %channel, attempt, "voice state lock timed out")
                }
            }
        }
        Err(Error::LockContention(format!("voice channel {channel}")))
    }

    async fn execute(&self, channel: ChannelId, effects: &SafetyEffects) {
        for member in &effects.unmute {
            match self.platform.set_voice_mute(channel, *member, false).await {
                Ok(()) => tracing::info!(channel = %channel, member = %member, "unmuted"),
                Err(e) => {
                    tracing::error!(channel = %channel, member = %member, error = %e, "unmute failed")
                }
            }
        }
        for member in &effects.mute {
            match self.platform.set_voice_mute(channel, *member, true).await {
                Ok(()) => tracing::info!(channel = %channel, member = %member, "muted"),
                Err(e) => {
                    tracing::error!(channel = %channel, member = %member, error = %e, "mute failed")
                }
            }
        }
        if let Some((adult, child)) = effects.alert {
            tracing::warn!(
                channel = %channel,
                adult = %adult,
                child = %child,
                "one adult and one child alone in voice channel"
            );
            self.moderators
                .notify(&formatting::voice_alert(channel, adult, child))
                .await;
        }
    }
}

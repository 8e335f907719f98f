//! Budget accounting and admission control for one session tree.
//!
//! A `Budget` is owned by exactly one session; the governor functions are
//! stateless and operate on the budget handed in, so no cross-session
//! synchronisation exists. Children are minted from the parent's
//! *remaining* allowance and rolled back up once the child seals.

use serde::Serialize;
use uuid::Uuid;

use crate::config::BudgetCaps;
use crate::config::InheritanceFractions;
use crate::config::Policy;
use crate::error::DeniedReason;
use crate::protocol::SessionSummary;

/// Scheduling state for one session: cumulative usage, configured caps,
/// and lineage. The parent link is a plain id, never ownership.
#[derive(Debug, Clone, Serialize)]
pub struct Budget {
    pub session_id: Uuid,
    pub parent: Option<Uuid>,
    /// Root is 0; each sub-session is one deeper.
    pub depth: u32,
    pub caps: BudgetCaps,
    #[serde(skip)]
    inherit: InheritanceFractions,

    pub tokens_used: u64,
    pub cost_usd_used: f64,
    pub turns_used: u32,
    pub wall_ms_used: u64,
    pub subcalls_spawned: u32,
}

impl Budget {
    pub fn root(policy: &Policy, session_id: Uuid) -> Budget {
        Budget {
            session_id,
            parent: None,
            depth: 0,
            caps: policy.caps,
            inherit: policy.inherit,
            tokens_used: 0,
            cost_usd_used: 0.0,
            turns_used: 0,
            wall_ms_used: 0,
            subcalls_spawned: 0,
        }
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.caps.max_tokens.saturating_sub(self.tokens_used)
    }

    pub fn remaining_cost_usd(&self) -> f64 {
        (self.caps.max_cost_usd - self.cost_usd_used).max(0.0)
    }

    pub fn remaining_wall_ms(&self) -> u64 {
        self.caps.max_wall_ms.saturating_sub(self.wall_ms_used)
    }

    pub fn remaining_turns(&self) -> u32 {
        self.caps.max_turns.saturating_sub(self.turns_used)
    }

    /// Admission check run before every model call. The projection is the
    /// prompt tokens already known plus a caller-supplied upper bound on
    /// completion tokens; wall is an upper estimate of the suspension.
    pub fn admit_model_call(
        &self,
        projected_tokens: u64,
        projected_cost_usd: f64,
        expected_wall_ms: u64,
    ) -> Result<(), DeniedReason> {
        if self.turns_used >= self.caps.max_turns {
            return Err(DeniedReason::Turns);
        }
        if self.tokens_used.saturating_add(projected_tokens) > self.caps.max_tokens {
            return Err(DeniedReason::Tokens);
        }
        if self.cost_usd_used + projected_cost_usd > self.caps.max_cost_usd {
            return Err(DeniedReason::Cost);
        }
        if self.wall_ms_used.saturating_add(expected_wall_ms) > self.caps.max_wall_ms {
            return Err(DeniedReason::Wall);
        }
        Ok(())
    }

    /// Admission check for a sandbox action within the current turn; only
    /// wall-clock can still be exceeded here.
    pub fn admit_action(&self, expected_wall_ms: u64) -> Result<(), DeniedReason> {
        if self.wall_ms_used.saturating_add(expected_wall_ms) > self.caps.max_wall_ms {
            return Err(DeniedReason::Wall);
        }
        Ok(())
    }

    /// Admission check run before spawning a sub-session.
    ///
    /// `max_subcall_depth` is minted as a remaining-depth allowance: each
    /// generation inherits one less, so `depth + allowance` is constant
    /// down the tree and equals the root cap. A spawn is admissible while
    /// any allowance remains.
    pub fn admit_subcall(&self) -> Result<(), DeniedReason> {
        if self.caps.max_subcall_depth == 0 {
            return Err(DeniedReason::Depth);
        }
        if self.subcalls_spawned >= self.caps.max_subcalls_per_session {
            return Err(DeniedReason::Siblings);
        }
        Ok(())
    }

    /// Mint a child budget from this budget's remaining allowance. Records
    /// the spawn on the parent. Every child cap is bounded by the parent's
    /// remaining allowance at this moment.
    pub fn mint_child(&mut self, child_session_id: Uuid) -> Budget {
        self.subcalls_spawned += 1;

        let max_tokens = (self.remaining_tokens() as f64 * self.inherit.tokens) as u64;
        let max_cost_usd = self.remaining_cost_usd() * self.inherit.cost;
        let max_wall_ms = (self.remaining_wall_ms() as f64 * self.inherit.wall) as u64;
        let max_turns = self
            .caps
            .max_turns
            .saturating_sub(1)
            .min(self.remaining_turns());

        Budget {
            session_id: child_session_id,
            parent: Some(self.session_id),
            depth: self.depth + 1,
            caps: BudgetCaps {
                max_tokens,
                max_cost_usd,
                max_turns,
                max_wall_ms,
                max_subcall_depth: self.caps.max_subcall_depth.saturating_sub(1),
                max_subcalls_per_session: self.caps.max_subcalls_per_session,
            },
            inherit: self.inherit,
            tokens_used: 0,
            cost_usd_used: 0.0,
            turns_used: 0,
            wall_ms_used: 0,
            subcalls_spawned: 0,
        }
    }

    /// Fold a sealed child's actual consumption back into this budget so
    /// later admission checks see the true remaining allowance.
    pub fn roll_up(&mut self, child: &SessionSummary) {
        self.tokens_used = self.tokens_used.saturating_add(child.tokens_used);
        self.cost_usd_used += child.cost_usd_used;
        self.wall_ms_used = self.wall_ms_used.saturating_add(child.wall_ms_used);
    }

    pub fn charge_model_call(&mut self, tokens_in: u64, tokens_out: u64, cost_usd: f64) {
        self.tokens_used = self
            .tokens_used
            .saturating_add(tokens_in)
            .saturating_add(tokens_out);
        self.cost_usd_used += cost_usd;
    }

    pub fn charge_wall(&mut self, wall_ms: u64) {
        self.wall_ms_used = self.wall_ms_used.saturating_add(wall_ms);
    }

    pub fn charge_turn(&mut self) {
        self.turns_used += 1;
    }
}

/// Plan and move types plus their text and JSON renderings.
use crate::inventory::GuestKind;
use crate::placement::{Method, Mode};
use serde::Serialize;
use std::fmt::Write as _;

/// One planned migration.
#[derive(Debug, Clone, Serialize)]
pub struct Move {
    pub id: u32,
    pub name: String,
    pub kind: GuestKind,
    pub from: String,
    pub to: String,
    /// Guest weight on the balanced dimension (bytes, or cores for cpu).
    pub weight: u64,
    pub dimension: Method,
    pub reason: String,
}

/// Ordered list of moves for one cycle. No guest appears twice and every
/// destination is a live, non-maintenance node.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub moves: Vec<Move>,
    pub spread_before: f64,
    pub spread_after: f64,
    pub method: Method,
    pub mode: Mode,
    pub warnings: Vec<String>,
}

impl Plan {
    pub fn new(method: Method, mode: Mode) -> Self {
        Self {
            moves: Vec::new(),
            spread_before: 0.0,
            spread_after: 0.0,
            method,
            mode,
            warnings: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Structured plan output for `--json`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "plan": self
                .moves
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "id": m.id,
                        "kind": m.kind,
                        "from": m.from,
                        "to": m.to,
                        "weight": m.weight,
                        "dimension": m.dimension,
                        "reason": m.reason,
                    })
                })
                .collect::<Vec<_>>(),
            "spread_before": self.spread_before,
            "spread_after": self.spread_after,
            "method": self.method,
            "mode": self.mode,
        })
    }

    /// Human-readable plan output for dry runs.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        if self.moves.is_empty() {
            let _ = writeln!(out, "cluster is balanced; no migrations required");
        } else {
            let _ = writeln!(
                out,
                "{} migration(s) planned ({}/{}):",
                self.moves.len(),
                self.method,
                self.mode
            );
            for m in &self.moves {
                let _ = writeln!(
                    out,
                    "  {} {} ({}): {} -> {} [weight {}, {}]",
                    m.kind, m.id, m.name, m.from, m.to, m.weight, m.reason
                );
            }
        }
        let _ = writeln!(
            out,
            "spread: {:.1}% -> {:.1}% (balanciness target applies to the {} dimension)",
            self.spread_before, self.spread_after, self.method
        );
        for w in &self.warnings {
            let _ = writeln!(out, "warning: {}", w);
        }
        out
    }
}

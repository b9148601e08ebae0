use crate::Board;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BoardSnapshot {
    pub steps: u64,
    pub exceptions_enabled: bool,
    pub intc: Option<IntcSnapshot>,
    pub peripherals: HashMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IntcSnapshot {
    pub device_id: u16,
    pub mode: Option<crate::drivers::intc::StartMode>,
    pub irq_asserted: bool,
}

impl BoardSnapshot {
    pub fn capture(board: &Board) -> Self {
        let intc = board.exception_handler().map(|h| IntcSnapshot {
            device_id: h.config().device_id,
            mode: h.mode(),
            irq_asserted: board
                .bus
                .intc
                .as_ref()
                .map(|s| s.irq_asserted())
                .unwrap_or(false),
        });
        let peripherals = board
            .bus
            .peripherals
            .iter()
            .map(|p| (p.name.clone(), p.dev.snapshot()))
            .collect();
        Self {
            steps: board.steps(),
            exceptions_enabled: board.exceptions_enabled(),
            intc,
            peripherals,
        }
    }
}

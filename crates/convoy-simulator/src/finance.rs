//! Per-convoy financial history.

use convoy_domain::{CostType, MAX_MONTHS};
use serde::{Deserialize, Serialize};

/// Month rows x cost columns; row 0 is the running month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialHistory {
    rows: Vec<[i64; CostType::COUNT]>,
    /// Profit of the running year
    pub jahresgewinn: i64,
}

impl Default for FinancialHistory {
    fn default() -> Self {
        Self {
            rows: vec![[0; CostType::COUNT]; MAX_MONTHS],
            jahresgewinn: 0,
        }
    }
}

impl FinancialHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` to the running month. Revenue and operating costs also
    /// feed the profit column and the yearly profit.
    pub fn book(&mut self, amount: i64, cost: CostType) {
        self.rows[0][cost.index()] += amount;
        if matches!(cost, CostType::Revenue | CostType::Operations | CostType::WayToll) {
            self.rows[0][CostType::Profit.index()] += amount;
            self.jahresgewinn += amount;
        }
    }

    /// Overwrite a gauge column (capacity, max speed) of the running month.
    pub fn set(&mut self, amount: i64, cost: CostType) {
        self.rows[0][cost.index()] = amount;
    }

    #[must_use]
    pub fn get(&self, month: usize, cost: CostType) -> i64 {
        self.rows.get(month).map_or(0, |row| row[cost.index()])
    }

    /// Roll rows down; gauge columns carry into the new month.
    pub fn new_month(&mut self) {
        let carried = self.rows[0];
        self.rows.rotate_right(1);
        let mut fresh = [0; CostType::COUNT];
        fresh[CostType::Capacity.index()] = carried[CostType::Capacity.index()];
        fresh[CostType::MaxSpeed.index()] = carried[CostType::MaxSpeed.index()];
        self.rows[0] = fresh;
    }

    pub fn new_year(&mut self) {
        self.jahresgewinn = 0;
    }

    /// Sum of a column over all kept months.
    #[must_use]
    pub fn total(&self, cost: CostType) -> i64 {
        self.rows.iter().map(|row| row[cost.index()]).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_feeds_profit() {
        let mut history = FinancialHistory::new();
        history.book(500, CostType::Revenue);
        history.book(-120, CostType::Operations);
        history.book(7, CostType::Distance);

        assert_eq!(history.get(0, CostType::Profit), 380);
        assert_eq!(history.get(0, CostType::Distance), 7);
        assert_eq!(history.jahresgewinn, 380);
    }

    #[test]
    fn test_month_rollover() {
        let mut history = FinancialHistory::new();
        history.set(40, CostType::Capacity);
        history.book(100, CostType::Revenue);
        history.new_month();

        assert_eq!(history.get(0, CostType::Revenue), 0);
        assert_eq!(history.get(1, CostType::Revenue), 100);
        assert_eq!(history.get(0, CostType::Capacity), 40);

        for _ in 0..MAX_MONTHS {
            history.new_month();
        }
        assert_eq!(history.total(CostType::Revenue), 0);
        assert_eq!(history.jahresgewinn, 100);
        history.new_year();
        assert_eq!(history.jahresgewinn, 0);
    }
}

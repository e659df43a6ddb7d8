//! Text rendering of training curves for terminal output.

use std::{fs, path::Path};

use anyhow::{Context, Result};

use crate::train::TrainingHistory;

const TRAIN_MARK: char = '*';
const VAL_MARK: char = 'o';
const BOTH_MARK: char = '#';

/// Train (`*`) and validation (`o`) accuracy per epoch on a 0..1 axis.
///
/// Epochs are resampled to at most `width` columns; `#` marks cells where
/// both curves land.
pub fn render_accuracy_chart(history: &TrainingHistory, width: usize, height: usize) -> String {
    let train = history.accuracy();
    let val = history.val_accuracy();
    let epochs = train.len();
    let title = "Model accuracy";
    if epochs == 0 || width == 0 || height < 2 {
        return format!("{title}\n(no epochs recorded)\n");
    }

    let columns = epochs.min(width);
    let mut grid = vec![vec![' '; columns]; height];
    let row_of = |acc: f32| {
        let acc = if acc.is_finite() { acc.clamp(0.0, 1.0) } else { 0.0 };
        height - 1 - (acc * (height - 1) as f32).round() as usize
    };
    for col in 0..columns {
        // Last epoch always lands in the last column.
        let epoch = if columns == 1 {
            epochs - 1
        } else {
            col * (epochs - 1) / (columns - 1)
        };
        let (t, v) = (row_of(train[epoch]), row_of(val[epoch]));
        grid[t][col] = TRAIN_MARK;
        grid[v][col] = if t == v { BOTH_MARK } else { VAL_MARK };
    }

    let mut out = format!("{title}\n{}\n", "=".repeat(title.len()));
    for (i, row) in grid.iter().enumerate() {
        let label = 1.0 - i as f32 / (height - 1) as f32;
        let line: String = row.iter().collect();
        out.push_str(&format!("{label:>5.2} |{}\n", line.trim_end()));
    }
    out.push_str(&format!("      +{}\n", "-".repeat(columns)));
    out.push_str(&format!(
        "       epoch 1..{epochs}   {TRAIN_MARK} train   {VAL_MARK} validation   best epoch {}\n",
        history.best_epoch
    ));
    out
}

/// Dump per-epoch metrics as pretty JSON.
pub fn write_history_json(history: &TrainingHistory, path: &Path) -> Result<()> {
    let json =
        serde_json::to_string_pretty(history).context("Failed to serialize training history")?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write training history: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::EpochMetrics;

    fn history(points: &[(f32, f32)]) -> TrainingHistory {
        TrainingHistory {
            epochs: points
                .iter()
                .enumerate()
                .map(|(i, &(accuracy, val_accuracy))| EpochMetrics {
                    epoch: i + 1,
                    loss: 1.0,
                    accuracy,
                    val_loss: 1.0,
                    val_accuracy,
                })
                .collect(),
            best_epoch: points.len(),
            stopped_early: false,
        }
    }

    #[test]
    fn chart_places_marks_by_accuracy() {
        let chart = render_accuracy_chart(&history(&[(0.0, 0.0), (1.0, 0.5)]), 10, 3);
        let lines: Vec<&str> = chart.lines().collect();

        assert_eq!(lines[0], "Model accuracy");
        assert_eq!(lines[2], " 1.00 | *");
        assert_eq!(lines[3], " 0.50 | o");
        assert_eq!(lines[4], " 0.00 |#");
        assert!(chart.contains("epoch 1..2"));
    }

    #[test]
    fn long_histories_are_resampled() {
        let points: Vec<(f32, f32)> = (0..100).map(|i| (i as f32 / 100.0, 0.5)).collect();
        let chart = render_accuracy_chart(&history(&points), 20, 5);
        let axis = chart.lines().find(|l| l.contains('+')).expect("axis line");
        assert_eq!(axis.trim_start().len(), 21);
    }

    #[test]
    fn empty_history_renders_placeholder() {
        let chart = render_accuracy_chart(&TrainingHistory::default(), 10, 5);
        assert!(chart.contains("no epochs"));
    }

    #[test]
    fn history_json_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        let h = history(&[(0.25, 0.5)]);
        write_history_json(&h, &path).expect("write");

        let text = fs::read_to_string(&path).expect("read");
        let parsed: TrainingHistory = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed, h);
    }
}

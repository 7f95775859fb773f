// projeto: genretrain
// file: src/neural/plot.rs
// Accuracy curves written as standalone HTML and as PNG

use std::fs;
use std::path::Path;

use log::info;
use plotly::common::{Mode, Title};
use plotly::layout::{Axis, Layout};
use plotly::{Plot, Scatter};
use plotters::prelude::{BitMapBackend, ChartBuilder, IntoDrawingArea, LineSeries, BLUE, RED, WHITE};

use crate::neural::metrics::AccuracyHistory;
use crate::neural::utils::TrainingError;

/// Training and test accuracy against `x_label`, on `[0, x_max] x [0, 1]`.
pub fn accuracy_plot(history: &AccuracyHistory, title: &str, x_label: &str, x_max: f64) -> Plot {
    let mut plot = Plot::new();

    let train = Scatter::new(history.steps.clone(), history.train.clone())
        .name("Training accuracy")
        .mode(Mode::Lines);
    let test = Scatter::new(history.steps.clone(), history.test.clone())
        .name("Testing accuracy")
        .mode(Mode::Lines);
    plot.add_trace(train);
    plot.add_trace(test);

    let layout = Layout::new()
        .title(Title::with_text(title))
        .x_axis(Axis::new().title(Title::with_text(x_label)).range(vec![0.0, x_max]))
        .y_axis(Axis::new().title(Title::with_text("Accuracy")).range(vec![0.0, 1.0]));
    plot.set_layout(layout);
    plot
}

pub fn write_plot(plot: &Plot, path: &Path) -> Result<(), TrainingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, plot.to_html())?;
    info!("📉 Plot saved to {}", path.display());
    Ok(())
}

const PNG_SIZE: (u32, u32) = (1024, 768);

fn plot_error<E: std::fmt::Display>(e: E) -> TrainingError {
    TrainingError::Plot(e.to_string())
}

/// Bitmap version of `accuracy_plot`: training in blue, testing in red.
pub fn write_png(
    history: &AccuracyHistory,
    title: &str,
    x_label: &str,
    x_max: f64,
    path: &Path,
) -> Result<(), TrainingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let root = BitMapBackend::new(path, PNG_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 20))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0f64..x_max.max(1.0), 0f64..1f64)
        .map_err(plot_error)?;
    chart
        .configure_mesh()
        .x_desc(x_label)
        .y_desc("Accuracy")
        .draw()
        .map_err(plot_error)?;

    let points = |values: &[f64]| -> Vec<(f64, f64)> {
        history.steps.iter().zip(values).map(|(&s, &v)| (s as f64, v)).collect()
    };
    chart
        .draw_series(LineSeries::new(points(&history.train), &BLUE))
        .map_err(plot_error)?;
    chart
        .draw_series(LineSeries::new(points(&history.test), &RED))
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    info!("📉 Plot saved to {}", path.display());
    Ok(())
}

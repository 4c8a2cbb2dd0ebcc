//! Report charts using Plotters and console summaries

use crate::pipeline::PipelineOutput;
use crate::rfm::{FeatureTable, Segment};
use plotters::prelude::*;

/// Bar color per segment, in `Segment::ALL` order
const SEGMENT_COLORS: [RGBColor; 5] = [
    GREEN,
    BLUE,
    RED,
    CYAN,
    RGBColor(128, 128, 128),
];

fn segment_color(segment: Segment) -> &'static RGBColor {
    let idx = Segment::ALL.iter().position(|s| *s == segment).unwrap_or(0);
    &SEGMENT_COLORS[idx]
}

/// Customer count per segment, every segment listed even when empty
pub fn segment_sizes(table: &FeatureTable) -> Vec<(Segment, usize)> {
    let counts = table.segment_counts();
    Segment::ALL
        .iter()
        .map(|s| (*s, counts.get(s).copied().unwrap_or(0)))
        .collect()
}

/// Companion file name next to the main chart, e.g. `report.png` -> `report_importance.png`
pub fn companion_path(base_output_path: &str, suffix: &str) -> String {
    match base_output_path.strip_suffix(".png") {
        Some(stem) => format!("{}_{}.png", stem, suffix),
        None => format!("{}_{}.png", base_output_path, suffix),
    }
}

/// Bar chart of customers per segment
pub fn create_segment_chart(table: &FeatureTable, output_path: &str) -> crate::Result<()> {
    let sizes = segment_sizes(table);
    let max_size = sizes.iter().map(|(_, n)| *n).max().unwrap_or(1).max(1) as f64;

    let root = BitMapBackend::new(output_path, (700, 450)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Customers per Segment", ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(-0.5f64..(sizes.len() as f64 - 0.5), 0f64..(max_size * 1.1))?;

    chart
        .configure_mesh()
        .x_labels(sizes.len())
        .x_label_formatter(&|x| {
            Segment::ALL
                .get(x.round() as usize)
                .map_or_else(String::new, |s| s.as_str().to_string())
        })
        .y_desc("Number of Customers")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    for (i, (segment, size)) in sizes.iter().enumerate() {
        chart.draw_series(std::iter::once(Rectangle::new(
            [(i as f64 - 0.4, 0.0), (i as f64 + 0.4, *size as f64)],
            segment_color(*segment).filled(),
        )))?;
    }

    root.present()?;
    println!("Segment chart saved to: {}", output_path);
    Ok(())
}

/// Bar chart of ranked feature importances
pub fn create_importance_chart(
    importances: &[(String, f64)],
    output_path: &str,
) -> crate::Result<()> {
    let max_value = importances
        .iter()
        .map(|(_, v)| *v)
        .fold(0.0f64, f64::max)
        .max(1e-9);
    let names: Vec<&str> = importances.iter().map(|(n, _)| n.as_str()).collect();

    let root = BitMapBackend::new(output_path, (700, 450)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Churn Feature Importance", ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(-0.5f64..(names.len() as f64 - 0.5), 0f64..(max_value * 1.1))?;

    chart
        .configure_mesh()
        .x_labels(names.len())
        .x_label_formatter(&|x| {
            names
                .get(x.round() as usize)
                .map_or_else(String::new, |n| n.to_string())
        })
        .y_desc("Importance")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    chart.draw_series(importances.iter().enumerate().map(|(i, (_, value))| {
        Rectangle::new([(i as f64 - 0.4, 0.0), (i as f64 + 0.4, *value)], BLUE.filled())
    }))?;

    root.present()?;
    println!("Feature importance chart saved to: {}", output_path);
    Ok(())
}

/// Print segment, model and offer summaries to stdout
pub fn print_statistics(output: &PipelineOutput) {
    let total = output.features.len().max(1) as f64;

    println!("\n=== Segment Statistics ===");
    println!("Total customers: {}", output.features.len());
    for (segment, size) in segment_sizes(&output.features) {
        println!(
            "  {:<10} {:>6} customers ({:.1}%)",
            segment.as_str(),
            size,
            size as f64 / total * 100.0
        );
    }

    println!("\n=== Churn Model ===");
    println!(
        "Window: {} days, churned: {}, active: {}",
        output.churn_labels.window_days,
        output.churn_labels.churned_count(),
        output.churn_labels.active_count()
    );
    if let Some(training) = &output.churn_training {
        println!("{}", training.report);
        match training.roc_auc {
            Some(auc) => println!("ROC-AUC: {:.4}", auc),
            None => println!("ROC-AUC: undefined (single class in test split)"),
        }
        if let Some(search) = &training.search {
            println!(
                "Best parameters: {} (CV ROC-AUC {:.4})",
                search.best_params, search.best_score
            );
        }
    }
    match &output.churn_model {
        Some(model) => {
            println!("Feature importances:");
            for (name, value) in model.feature_importances() {
                println!("  {:<14} {:.4}", name, value);
            }
        }
        None => println!("No churn model: every customer has the same churn label"),
    }

    if let Some(ltv) = &output.ltv_training {
        println!("\n=== LTV Model ===");
        println!("{} ({})", ltv.metrics, ltv.model.model_type);
    }

    println!("\n=== Campaign Summary ===");
    for row in &output.campaign {
        println!(
            "  {:>5} x {} (cost {:.2}, expected revenue {:.2})",
            row.customer_count, row.offer, row.total_cost, row.expected_revenue
        );
    }
}

/// Segment chart at `base_output_path`, importance chart beside it, then console stats
pub fn generate_report(output: &PipelineOutput, base_output_path: &str) -> crate::Result<()> {
    create_segment_chart(&output.features, base_output_path)?;

    if let Some(model) = &output.churn_model {
        let importance_path = companion_path(base_output_path, "importance");
        create_importance_chart(&model.feature_importances(), &importance_path)?;
    }

    print_statistics(output);
    Ok(())
}

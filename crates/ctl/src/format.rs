use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use vmrepobuild::{
    orchestrator::{BuildPlan, BuildReport},
    spec::Spec,
};

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

fn spec_base(spec: &Spec) -> String {
    spec.properties.base.clone().unwrap_or_default()
}

pub fn plan_table(plan: &BuildPlan) -> Table {
    let mut table = table(vec!["batch", "image", "name", "base"]);
    for (index, batch) in plan.batches().iter().enumerate() {
        for spec in batch.nodes.iter().filter_map(|node| node.payload.as_ref()) {
            table.add_row(vec![
                Cell::new(index),
                Cell::new(&spec.id),
                Cell::new(spec.name()),
                Cell::new(spec_base(spec)),
            ]);
        }
    }
    table
}

pub fn report_table(report: &BuildReport) -> Table {
    let mut table = table(vec!["batch", "image", "status", "result"]);
    for outcome in &report.outcomes {
        let (status, color, result) = match &outcome.result {
            Ok(built) => ("built", Color::Green, built.artifact.display().to_string()),
            Err(error) => ("failed", Color::Red, error.to_string()),
        };
        table.add_row(vec![
            Cell::new(outcome.batch),
            Cell::new(&outcome.id),
            Cell::new(status).fg(color),
            Cell::new(result),
        ]);
    }
    table
}

use console::Style;
use meridian_core::pipeline::{OrchestratorConfig, OutcomeStatus, RegistrationOutcome, Report};
use meridian_core::similarity::Metric;

struct Styles {
    title: Style,
    header: Style,
    label: Style,
    value: Style,
    method: Style,
    disabled: Style,
    path: Style,
    success: Style,
    failure: Style,
}

impl Styles {
    fn new() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            header: Style::new().cyan().bold(),
            label: Style::new().dim(),
            value: Style::new().bold().white(),
            method: Style::new().green(),
            disabled: Style::new().dim().yellow(),
            path: Style::new().underlined(),
            success: Style::new().green().bold(),
            failure: Style::new().red().bold(),
        }
    }

    fn status(&self, status: OutcomeStatus) -> &Style {
        match status {
            OutcomeStatus::Success => &self.success,
            OutcomeStatus::Failed => &self.failure,
            OutcomeStatus::Skipped => &self.disabled,
        }
    }
}

pub fn print_registration_summary(config: &OrchestratorConfig) {
    let s = Styles::new();
    let reg = &config.registration;

    println!();
    println!("  {}", s.title.apply_to("Meridian Registration"));
    println!("  {}", s.title.apply_to("\u{2550}".repeat(21)));
    println!();

    println!(
        "  {:<14}{}",
        s.label.apply_to("Input"),
        s.path.apply_to(config.input_dir.display())
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Output"),
        s.path.apply_to(config.output_dir.display())
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Pattern"),
        s.value.apply_to(&config.file_pattern)
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Template"),
        s.method.apply_to(&config.template)
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Workers"),
        s.value.apply_to(config.workers)
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Device"),
        s.method.apply_to(&reg.device)
    );
    if let Some(timeout) = config.timeout_secs {
        println!(
            "  {:<14}{}",
            s.label.apply_to("Timeout"),
            s.value.apply_to(format!("{timeout} s"))
        );
    }
    println!();

    println!("  {}", s.header.apply_to("Similarity"));
    println!(
        "    {:<12}{}",
        s.label.apply_to("Metric"),
        s.method.apply_to(&reg.similarity.metric)
    );
    match reg.similarity.metric {
        Metric::Lncc => println!(
            "    {:<12}{}",
            s.label.apply_to("Kernel"),
            s.value.apply_to(format!("{} vox", reg.similarity.kernel_size))
        ),
        Metric::MutualInformation => println!(
            "    {:<12}{}",
            s.label.apply_to("Bins"),
            s.value.apply_to(reg.similarity.histogram_bins)
        ),
        Metric::Mse => {}
    }
    if reg.similarity.normalize {
        println!(
            "    {:<12}{}",
            s.label.apply_to("Normalize"),
            s.value.apply_to(format!(
                "{}-{} pct",
                reg.similarity.lower_percentile, reg.similarity.upper_percentile
            ))
        );
    } else {
        println!(
            "    {:<12}{}",
            s.label.apply_to("Normalize"),
            s.disabled.apply_to("disabled")
        );
    }
    println!();

    println!("  {}", s.header.apply_to("Affine"));
    println!(
        "    {:<12}{}",
        s.label.apply_to("Iterations"),
        s.value.apply_to(reg.affine.max_iterations)
    );
    println!(
        "    {:<12}{}",
        s.label.apply_to("Rate"),
        s.value.apply_to(reg.affine.learning_rate)
    );
    println!();

    if reg.deformable.enabled {
        println!("  {}", s.header.apply_to("Deformable"));
        println!(
            "    {:<12}{}",
            s.label.apply_to("Iterations"),
            s.value.apply_to(reg.deformable.max_iterations)
        );
        println!(
            "    {:<12}{}",
            s.label.apply_to("Rate"),
            s.value.apply_to(reg.deformable.learning_rate)
        );
        println!(
            "    {:<12}{}",
            s.label.apply_to("Smoothness"),
            s.value.apply_to(reg.deformable.smoothness_weight)
        );
        println!(
            "    {:<12}{}",
            s.label.apply_to("Gradient"),
            s.value.apply_to(reg.deformable.gradient_weight)
        );
        println!(
            "    {:<12}{}",
            s.label.apply_to("Squarings"),
            s.value.apply_to(reg.deformable.integration_steps)
        );
    } else {
        println!(
            "  {:<14}{}",
            s.header.apply_to("Deformable"),
            s.disabled.apply_to("disabled")
        );
    }
    println!();
}

pub fn print_outcome(outcome: &RegistrationOutcome) {
    let s = Styles::new();
    print_outcome_line(&s, outcome);
}

fn print_outcome_line(s: &Styles, outcome: &RegistrationOutcome) {
    let name = outcome
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| outcome.input.display().to_string());
    let detail = match outcome.status {
        OutcomeStatus::Success => outcome.output.display().to_string(),
        OutcomeStatus::Failed => match outcome.failure_kind {
            Some(kind) => format!("{kind}: {}", outcome.message),
            None => outcome.message.clone(),
        },
        OutcomeStatus::Skipped => outcome.message.clone(),
    };
    println!(
        "  {:<9}{:>7.1}s  {}  {}",
        s.status(outcome.status)
            .apply_to(outcome.status.to_string().to_uppercase()),
        outcome.elapsed.as_secs_f64(),
        s.value.apply_to(name),
        s.label.apply_to(detail)
    );
    for warning in &outcome.warnings {
        println!("             {}", s.disabled.apply_to(warning));
    }
}

pub fn print_report(report: &Report) {
    let s = Styles::new();

    println!();
    println!("  {}", s.header.apply_to("Results"));
    for outcome in &report.file_results {
        print_outcome_line(&s, outcome);
    }
    println!();
    println!(
        "  {:<14}{}",
        s.label.apply_to("Total"),
        s.value.apply_to(report.total)
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Successful"),
        s.success.apply_to(report.successful)
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Failed"),
        s.failure.apply_to(report.failed)
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Skipped"),
        s.disabled.apply_to(report.skipped)
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Elapsed"),
        s.value.apply_to(format!("{:.1} s", report.elapsed.as_secs_f64()))
    );
    if let Some(ref template) = report.template {
        println!(
            "  {:<14}{}",
            s.label.apply_to("Template"),
            s.path.apply_to(template.display())
        );
    }
    // Per-file errors are already listed above.
    if report.total == 0 {
        for error in &report.errors {
            println!("  {}", s.failure.apply_to(error));
        }
    }
    println!();
}

use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use vmrepobuild::progress::{BuildProgress, BuildProgressPhase};

const SPINNER_STRINGS: &[&str] = &[
    "[=                   ]",
    "[ =                  ]",
    "[  =                 ]",
    "[   =                ]",
    "[    =               ]",
    "[     =              ]",
    "[      =             ]",
    "[       =            ]",
    "[        =           ]",
    "[         =          ]",
    "[          =         ]",
    "[           =        ]",
    "[            =       ]",
    "[             =      ]",
    "[              =     ]",
    "[               =    ]",
    "[                =   ]",
    "[                 =  ]",
    "[                  = ]",
    "[                   =]",
    "[====================]",
];

pub fn phase_text(phase: BuildProgressPhase) -> &'static str {
    match phase {
        BuildProgressPhase::Waiting => "waiting",
        BuildProgressPhase::Acquiring => "acquiring",
        BuildProgressPhase::Transforming => "transforming",
        BuildProgressPhase::Hashing => "hashing",
        BuildProgressPhase::Compressing => "compressing",
        BuildProgressPhase::Complete => "complete",
        BuildProgressPhase::Failed => "failed",
    }
}

fn configure_for_progress(bar: &ProgressBar, progress: &BuildProgress) -> Result<()> {
    if bar.is_finished() {
        return Ok(());
    }
    bar.set_prefix(format!(
        "{:width$} {:12}",
        progress.image,
        phase_text(progress.phase),
        width = 16
    ));
    let message = progress.message.clone().unwrap_or_default();

    match progress.phase {
        BuildProgressPhase::Acquiring | BuildProgressPhase::Compressing if progress.total > 0 => {
            bar.set_style(
                ProgressStyle::with_template(
                    "{prefix} [{bar:20}] {msg} {binary_bytes}/{binary_total_bytes} ({binary_bytes_per_sec}) eta: {eta}",
                )?
                .progress_chars("=>-"),
            );
            bar.set_length(progress.total);
            bar.set_position(progress.value);
            bar.set_message(message);
        }

        BuildProgressPhase::Complete => {
            bar.set_style(
                ProgressStyle::with_template("{prefix} [{bar:20}] {binary_total_bytes}")?
                    .progress_chars("=>-"),
            );
            bar.set_length(progress.total);
            bar.set_position(progress.total);
            bar.finish();
        }

        BuildProgressPhase::Failed => {
            bar.set_style(ProgressStyle::with_template("{prefix} {msg}")?);
            bar.abandon_with_message(message);
        }

        _ => {
            bar.set_style(
                ProgressStyle::with_template("{prefix} {spinner}  {msg}")?
                    .tick_strings(SPINNER_STRINGS),
            );
            bar.set_message(message);
        }
    }
    bar.tick();
    Ok(())
}

/// Draws one bar per image until every progress sender is gone.
pub async fn render_build_progress(mut receiver: Receiver<BuildProgress>) -> Result<()> {
    let multi_progress = MultiProgress::new();
    multi_progress.set_move_cursor(false);
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();

    loop {
        let progress = match receiver.recv().await {
            Ok(progress) => progress,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        let bar = bars.entry(progress.image.clone()).or_insert_with(|| {
            let bar = multi_progress.add(ProgressBar::new_spinner());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        configure_for_progress(bar, &progress)?;
    }

    for bar in bars.values() {
        if !bar.is_finished() {
            bar.finish_and_clear();
        }
    }
    Ok(())
}

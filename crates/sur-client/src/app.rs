//! Command implementations behind the `sur` binary.
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use sur_client::api::ServiceClient;
use sur_client::export::{BatchExporter, DirSink, ExportReport};
use sur_client::monitor::ConnectionMonitor;
use sur_client::mpv::MpvDevice;
use sur_client::playback::{format_time, DeviceEvent, PlaybackController, PlaybackDevice};
use sur_client::poller::{JobPoller, JobSnapshot, PollOutcome};
use sur_client::submit::SubmissionClient;
use sur_proto::config::Config;
use sur_proto::protocol::{SeparationJob, StemMap};
use sur_proto::validate::Validator;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

enum Follow {
    /// A job handed back by the upload, possibly already terminal.
    Resume(SeparationJob),
    Poll(String),
}

pub struct App {
    config: Config,
    client: ServiceClient,
    cancel: CancellationToken,
}

impl App {
    pub fn new(config: Config, cancel: CancellationToken) -> anyhow::Result<Self> {
        let client = ServiceClient::from_config(&config.server)
            .with_context(|| format!("building client for {}", config.server.base_url))?;
        Ok(Self {
            config,
            client,
            cancel,
        })
    }

    pub async fn health(&self) -> anyhow::Result<()> {
        match self.client.health().await {
            Ok(health) if health.is_healthy() => {
                println!("{}: available", self.client.base_url());
                Ok(())
            }
            Ok(health) => bail!(
                "{}: not available (status {})",
                self.client.base_url(),
                health.status
            ),
            Err(e) => bail!("{}: unreachable ({})", self.client.base_url(), e),
        }
    }

    pub async fn separate(
        &self,
        file: &Path,
        out: Option<PathBuf>,
        export: bool,
    ) -> anyhow::Result<()> {
        let monitor = ConnectionMonitor::spawn(
            self.client.clone(),
            self.config.server.health_interval(),
        );
        let state = monitor.wait_for_first_probe().await;
        if !state.is_available {
            bail!(
                "separation service at {} is not available: {}",
                self.client.base_url(),
                state.last_error.as_deref().unwrap_or("not healthy")
            );
        }

        let submitter = SubmissionClient::new(
            self.client.clone(),
            Validator::from_config(&self.config.upload),
        );
        let job = submitter
            .submit_path(file)
            .await
            .with_context(|| format!("submitting {}", file.display()))?;
        eprintln!("submitted {} as job {}", file.display(), job.job_id);

        let job_id = job.job_id.clone();
        let outcome = self.follow(Follow::Resume(job)).await;
        drop(monitor);

        let Some(job) = self.settle(&job_id, outcome)? else {
            return Ok(());
        };
        if export {
            let stems = completed_stems(&job)?;
            self.export_stems(&job_id, stems, out).await?;
        }
        Ok(())
    }

    pub async fn status(&self, job_id: &str) -> anyhow::Result<()> {
        let outcome = self.follow(Follow::Poll(job_id.to_string())).await;
        self.settle(job_id, outcome)?;
        Ok(())
    }

    pub async fn export(&self, job_id: &str, out: Option<PathBuf>) -> anyhow::Result<()> {
        let job = self
            .client
            .job_status(job_id)
            .await
            .with_context(|| format!("fetching status of {}", job_id))?;
        let stems = completed_stems(&job)?;
        self.export_stems(job_id, stems, out).await
    }

    pub async fn play(&self, job_id: &str, stem: &str) -> anyhow::Result<()> {
        let job = self
            .client
            .job_status(job_id)
            .await
            .with_context(|| format!("fetching status of {}", job_id))?;
        let stems = completed_stems(&job)?;
        let Some(path) = stems.get(stem) else {
            let names: Vec<&str> = stems.keys().map(String::as_str).collect();
            bail!(
                "no stem '{}' in job {}; available: {}",
                stem,
                job_id,
                names.join(", ")
            );
        };

        let device = MpvDevice::spawn(&format!("{}-{}", job_id, stem)).await?;
        let mut controller = PlaybackController::new(device, self.client.url_for(path));
        controller.activate().await;
        eprintln!("{}: p play/pause, m mute, s <0..1> seek, r reload, q quit", stem);

        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    if !run_command(&mut controller, line.trim()).await {
                        break;
                    }
                    print_state(&controller);
                }
                Some(event) = controller.next_event() => {
                    if !matches!(event, DeviceEvent::PositionUpdated(_)) {
                        info!("play: {} {:?}", stem, event);
                    }
                    print_state(&controller);
                }
            }
        }

        controller.deactivate();
        eprintln!();
        Ok(())
    }

    /// Run a poller to the end while echoing its snapshots to stderr.
    async fn follow(&self, start: Follow) -> PollOutcome {
        let poller = JobPoller::new(self.client.clone(), self.config.polling.interval());
        let printer = tokio::spawn(print_snapshots(poller.subscribe()));
        let outcome = match start {
            Follow::Resume(job) => poller.resume(job, &self.cancel, announce_completion).await,
            Follow::Poll(job_id) => poller.run(&job_id, &self.cancel, announce_completion).await,
        };
        printer.abort();
        outcome
    }

    /// Report an outcome; `Some(job)` only when the job completed.
    fn settle(
        &self,
        job_id: &str,
        outcome: PollOutcome,
    ) -> anyhow::Result<Option<SeparationJob>> {
        match outcome {
            PollOutcome::Completed(job) => Ok(Some(job)),
            PollOutcome::Failed(message) => bail!("job {} failed: {}", job_id, message),
            PollOutcome::Errored(e) => bail!("lost track of job {}: {}", job_id, e),
            PollOutcome::Cancelled => {
                eprintln!("stopped following job {}", job_id);
                Ok(None)
            }
        }
    }

    async fn export_stems(
        &self,
        job_id: &str,
        stems: &StemMap,
        out: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        let dir = out.unwrap_or_else(|| self.config.paths.downloads_dir.join(job_id));
        let mut sink = DirSink::new(&dir);
        let exporter = BatchExporter::new(self.client.clone());

        let report = exporter
            .export_each(stems, &mut sink, |name, result| match result {
                Ok(path) => eprintln!("  saved {} → {}", name, path.display()),
                Err(e) => eprintln!("  {} failed: {}", name, e),
            })
            .await;
        summarize(&report, &dir)
    }
}

fn announce_completion(job: &SeparationJob) {
    eprintln!();
    match job.completed_stems() {
        Some(stems) => {
            println!("job {} completed with {} stems:", job.job_id, stems.len());
            for (name, path) in stems {
                println!("  {:<10} {}", name, path);
            }
        }
        None => println!("job {} completed without stems", job.job_id),
    }
}

fn completed_stems(job: &SeparationJob) -> anyhow::Result<&StemMap> {
    match job.completed_stems() {
        Some(stems) => Ok(stems),
        None => bail!("job {} is {}, no stems to fetch", job.job_id, job.status),
    }
}

fn summarize(report: &ExportReport, dir: &Path) -> anyhow::Result<()> {
    println!(
        "exported {} of {} stems to {}",
        report.saved.len(),
        report.attempted(),
        dir.display()
    );
    if report.saved.is_empty() && !report.failures.is_empty() {
        bail!("no stems could be exported");
    }
    for failure in &report.failures {
        warn!("export: {} not saved: {}", failure.name, failure.error);
    }
    Ok(())
}

async fn print_snapshots(mut rx: watch::Receiver<JobSnapshot>) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(job) = snapshot.job {
            match job.progress() {
                Some(p) => eprint!("\r{} {:>5.1}%   ", job.status, p),
                None => eprint!("\r{}         ", job.status),
            }
        }
    }
}

/// Apply one stdin command.  Returns false on quit.
async fn run_command<D: PlaybackDevice>(
    controller: &mut PlaybackController<D>,
    line: &str,
) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("q") => return false,
        Some("p") => controller.toggle_play_pause().await,
        Some("m") => controller.toggle_mute(),
        Some("r") => controller.reload().await,
        Some("s") => match parts.next().and_then(|f| f.parse::<f64>().ok()) {
            Some(fraction) => controller.seek(fraction).await,
            None => eprintln!("usage: s <fraction between 0 and 1>"),
        },
        Some(other) => eprintln!("unknown command '{}'", other),
        None => {}
    }
    true
}

fn print_state<D: PlaybackDevice>(controller: &PlaybackController<D>) {
    let state = controller.state();
    if let Some(error) = &state.last_error {
        eprint!("\r[error] {} (r to reload)          ", error);
        return;
    }
    if state.is_loading {
        eprint!("\r[loading]                          ");
        return;
    }
    let duration = state
        .duration_secs
        .map(format_time)
        .unwrap_or_else(|| "-:--".into());
    eprint!(
        "\r[{}{}] {} / {} ({:.0}%)   ",
        if state.is_playing { "playing" } else { "paused" },
        if state.is_muted { ", muted" } else { "" },
        format_time(state.position_secs),
        duration,
        controller.progress_fraction() * 100.0
    );
}

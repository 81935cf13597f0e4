//! Client commands against a running server: `run`, `jobs`, `job`, `cancel`,
//! `profiles`, `status`.

use anyhow::{Context, Result, bail};

use agentcore::client::ApiClient;
use agentcore_common::{Job, JobListQuery, JobStatus, SubmitJobRequest};

const TASK_PREVIEW_CHARS: usize = 60;

pub async fn cmd_run(request: SubmitJobRequest, json: bool) -> Result<()> {
    let client = ApiClient::from_env()?;
    let wait = request.wait;
    if wait {
        eprintln!("Waiting for job to finish...");
    }
    let job = client.submit(&request).await?;

    if json {
        println!("{}", to_json(&job)?);
    } else if wait {
        print_job(&job);
    } else {
        println!("Submitted job {} ({})", job.id(), job.status());
        println!("Follow it with: agentcore job {}", job.id());
    }

    if wait && job.status() != JobStatus::Succeeded {
        bail!("Job {} ended {}", job.id(), job.status());
    }
    Ok(())
}

pub async fn cmd_jobs(limit: usize, status: Option<JobStatus>) -> Result<()> {
    let client = ApiClient::from_env()?;
    let list = client
        .jobs(&JobListQuery {
            limit: Some(limit),
            status,
        })
        .await?;

    if list.jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<10}  {:<10}  {:<20}  TASK",
        "ID", "STATUS", "PROFILE", "CREATED"
    );
    for job in &list.jobs {
        println!("{}", job_row(job));
    }
    Ok(())
}

pub async fn cmd_job(id: &str, json: bool) -> Result<()> {
    let job = ApiClient::from_env()?.job(id).await?;
    if json {
        println!("{}", to_json(&job)?);
    } else {
        print_job(&job);
    }
    Ok(())
}

pub async fn cmd_cancel(id: &str) -> Result<()> {
    let response = ApiClient::from_env()?.cancel(id).await?;
    if response.cancelled {
        println!("Cancelled job {}.", response.id);
    } else {
        println!("Job {} already {}; nothing to cancel.", response.id, response.status);
    }
    Ok(())
}

pub async fn cmd_profiles() -> Result<()> {
    let profiles = ApiClient::from_env()?.profiles().await?;
    if profiles.is_empty() {
        println!("No profiles available.");
        return Ok(());
    }
    for p in profiles {
        let mut flags = Vec::new();
        if p.worktree {
            flags.push("worktree");
        }
        if p.auto_pr {
            flags.push("auto-pr");
        }
        println!(
            "{:<16} {} ({} turns, {}){}",
            p.name,
            p.model,
            p.max_turns,
            p.permission_mode,
            if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            }
        );
        if let Some(parent) = &p.extends {
            println!("{:<16} extends {}", "", parent);
        }
        if !p.description.is_empty() {
            println!("{:<16} {}", "", p.description);
        }
    }
    Ok(())
}

pub async fn cmd_status() -> Result<()> {
    let client = ApiClient::from_env()?;
    let health = client.health().await?;
    println!("Server:   {}", client.base_url());
    println!("Service:  {}", health.service);
    println!("Worker:   {}", health.worker);
    println!("Status:   {}", health.status);
    println!("Draining: {}", if health.draining { "yes" } else { "no" });
    Ok(())
}

fn to_json(job: &Job) -> Result<String> {
    serde_json::to_string_pretty(job).context("Failed to render job")
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > TASK_PREVIEW_CHARS || text.lines().nth(1).is_some() {
        let cut: String = line.chars().take(TASK_PREVIEW_CHARS).collect();
        format!("{}...", cut.trim_end())
    } else {
        line.to_string()
    }
}

fn job_row(job: &Job) -> String {
    format!(
        "{:<36}  {:<10}  {:<10}  {:<20}  {}",
        job.id(),
        job.status().as_str(),
        job.profile(),
        job.created_at().format("%Y-%m-%d %H:%M:%S"),
        preview(job.task())
    )
}

fn print_job(job: &Job) {
    println!("Job:       {}", job.id());
    println!("Status:    {}", job.status());
    println!("Profile:   {}", job.profile());
    println!("Task:      {}", job.task());
    if let Some(repo) = job.repo_url() {
        println!("Repo:      {}", repo);
    }
    if let Some(base) = job.base_ref() {
        println!("Base:      {}", base);
    }
    if let Some(worker) = job.worker() {
        println!("Worker:    {}", worker);
    }
    if let Some(code) = job.exit_code() {
        println!("Exit code: {}", code);
    }
    if let Some(session) = job.session_id() {
        println!("Session:   {}", session);
    }
    if let Some(url) = job.pr_url() {
        println!("PR:        {}", url);
    }
    println!("Created:   {}", job.created_at().to_rfc3339());
    if let Some(ended) = job.ended_at() {
        println!("Ended:     {}", ended.to_rfc3339());
    }
    if let Some(error) = job.error() {
        println!();
        println!("Error:");
        println!("{}", error.trim_end());
    }
    if let Some(output) = job.output().filter(|o| !o.trim().is_empty()) {
        println!();
        println!("Output:");
        println!("{}", output.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentcore_common::NewJob;

    #[test]
    fn test_preview_truncates_long_and_multiline_tasks() {
        assert_eq!(preview("short task"), "short task");
        let long = "x".repeat(100);
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), TASK_PREVIEW_CHARS + 3);
        assert_eq!(preview("first line\nsecond"), "first line...");
    }

    #[test]
    fn test_job_row_contains_key_fields() {
        let job = Job::new(NewJob::new("fix the flaky test", "review"));
        let row = job_row(&job);
        assert!(row.starts_with(job.id()));
        assert!(row.contains("queued"));
        assert!(row.contains("review"));
        assert!(row.ends_with("fix the flaky test"));
    }
}

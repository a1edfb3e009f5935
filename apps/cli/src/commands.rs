use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use rhizome::config::{CONFIG_FILE_NAME, ConfigLoader};
use rhizome::{BuildResult, Persistor, SiteBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::Duration;

const DEBOUNCE_DURATION: Duration = Duration::from_millis(300);

pub struct BuildOptions {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub profile: Option<String>,
    pub jobs: Option<usize>,
    pub force: bool,
}

impl BuildOptions {
    fn root(&self) -> &Path {
        self.input.as_deref().unwrap_or(Path::new("."))
    }

    fn builder(&self) -> SiteBuilder {
        let mut builder = SiteBuilder::new(self.root());
        if let Some(output) = &self.output {
            builder = builder.output_dir(output);
        }
        if let Some(profile) = &self.profile {
            builder = builder.profile(profile);
        }
        if let Some(jobs) = self.jobs {
            builder = builder.jobs(jobs);
        }
        builder
    }
}

fn print_summary(result: &BuildResult) {
    println!(
        "Regenerated {} units, skipped {} in {:.2?}{}",
        result.regenerated_count,
        result.skipped_count,
        result.duration,
        if result.full_rebuild {
            " (full rebuild)"
        } else {
            ""
        }
    );
    if result.cache_recovered {
        println!("Cache was unreadable and has been rebuilt");
    }
    for warning in &result.warnings {
        println!("warning: {warning}");
    }
    if !result.errors.is_empty() {
        eprintln!("{} units failed:", result.errors.len());
        for error in &result.errors {
            eprintln!("  {} ({}): {}", error.unit, error.kind, error.message);
        }
    }
}

pub fn build_site(options: &BuildOptions) -> Result<ExitCode, Box<dyn std::error::Error>> {
    println!("Building site...");
    let result = options.builder().build(options.force)?;
    print_summary(&result);

    if result.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

pub fn watch_site(options: &BuildOptions) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let root = options.root().to_path_buf();
    let config = ConfigLoader::new(&root)
        .profile(options.profile.clone())
        .load()?
        .site;

    if let Err(error) = build_site(options) {
        eprintln!("Build error: {error}");
    }

    let (notify_tx, notify_rx) = channel();
    let mut watcher = RecommendedWatcher::new(
        notify_tx,
        Config::default().with_poll_interval(Duration::from_millis(200)),
    )?;

    for directory in [&config.content_dir, &config.templates_dir, &config.data_dir] {
        let path = root.join(directory);
        if path.exists() {
            watcher.watch(&path, RecursiveMode::Recursive)?;
        }
    }
    let config_path = root.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        watcher.watch(&config_path, RecursiveMode::NonRecursive)?;
    }

    println!("Watching {} for changes, press Ctrl+C to stop", root.display());

    loop {
        match notify_rx.recv() {
            Ok(_event) => {
                loop {
                    match notify_rx.recv_timeout(DEBOUNCE_DURATION) {
                        Ok(_) => continue,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => return Ok(ExitCode::SUCCESS),
                    }
                }

                println!("Changes detected, rebuilding...");
                match options.builder().build(false) {
                    Ok(result) => {
                        for event in &result.events {
                            println!("  {event}");
                        }
                        print_summary(&result);
                    }
                    Err(error) => eprintln!("Rebuild error: {error}"),
                }
            }
            Err(error) => {
                eprintln!("Watch error: {error}");
                return Ok(ExitCode::FAILURE);
            }
        }
    }
}

pub fn clean_site(
    input: Option<&Path>,
    remove_output: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let root = input.unwrap_or(Path::new("."));
    let config = ConfigLoader::new(root).load()?.site;

    Persistor::new(root.join(&config.cache_dir)).clear()?;
    println!("Removed cache {}", root.join(&config.cache_dir).display());

    if remove_output {
        let output_dir = root.join(&config.output_dir);
        if output_dir.exists() {
            fs::remove_dir_all(&output_dir)?;
            println!("Removed output {}", output_dir.display());
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn site() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "title = \"Test\"\nbase_url = \"https://example.com\"\n",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("content")).unwrap();
        fs::write(
            dir.path().join("content/hello.md"),
            "+++\ntitle = \"Hello\"\n+++\nHi.",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_clean_removes_cache_and_output() {
        let dir = site();
        SiteBuilder::new(dir.path()).build(false).unwrap();
        assert!(dir.path().join(".rhizome-cache").exists());

        clean_site(Some(dir.path()), true).unwrap();
        assert!(!dir.path().join(".rhizome-cache").exists());
        assert!(!dir.path().join("public").exists());
    }

    #[test]
    fn test_builder_honors_output_override() {
        let dir = site();
        let output = dir.path().join("dist");
        let options = BuildOptions {
            input: Some(dir.path().to_path_buf()),
            output: Some(output.clone()),
            profile: None,
            jobs: Some(2),
            force: false,
        };
        build_site(&options).unwrap();
        assert!(output.join("hello/index.html").exists());
    }
}

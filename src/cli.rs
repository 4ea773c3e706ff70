use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "ecs-hatch",
    version,
    about = "Browse ECS clusters and open shells, logs and environment editors on running tasks."
)]
pub struct CliArgs {
    /// AWS profile to use (overrides the config file)
    #[arg(short, long)]
    pub profile: Option<String>,

    /// Region to offer at the top level; repeat for several (overrides the config file)
    #[arg(short, long = "region")]
    pub regions: Vec<String>,

    /// tracing filter (for example: info,ecs_hatch=debug)
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

impl CliArgs {
    /// Applies command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut crate::config::Config) {
        if let Some(profile) = &self.profile {
            config.aws.profile = Some(profile.clone());
        }
        if !self.regions.is_empty() {
            config.aws.regions = self.regions.clone();
        }
    }
}

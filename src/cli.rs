use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "caprouter")]
#[command(about = "Route AI capability requests across providers with fallback and circuit breaking")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Disable colors in output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Options shared by every generation command.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RouteArgs {
    /// Use only this provider (no fallback)
    #[arg(short, long)]
    pub provider: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show circuit state for every provider
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the providers that would serve a capability, in order
    Resolve {
        /// Capability (text, text_stream, image, image_edit, video, speech)
        capability: String,

        #[command(flatten)]
        route: RouteArgs,
    },

    /// Generate text
    Text {
        prompt: String,

        /// System instructions
        #[arg(short, long)]
        system: Option<String>,

        #[arg(short, long)]
        temperature: Option<f32>,

        #[arg(short, long)]
        max_tokens: Option<u32>,

        #[command(flatten)]
        route: RouteArgs,
    },

    /// Generate text and print it as it arrives
    Stream {
        prompt: String,

        /// System instructions
        #[arg(short, long)]
        system: Option<String>,

        #[command(flatten)]
        route: RouteArgs,
    },

    /// Generate an image
    Image {
        prompt: String,

        /// Size, e.g. 1024x1024
        #[arg(long)]
        size: Option<String>,

        /// Aspect ratio, e.g. 16:9
        #[arg(long)]
        aspect_ratio: Option<String>,

        #[command(flatten)]
        route: RouteArgs,
    },

    /// Edit an existing image
    Edit {
        /// Path to the source image
        image: String,

        instruction: String,

        #[command(flatten)]
        route: RouteArgs,
    },

    /// Generate a video (blocks until the job finishes)
    Video {
        prompt: String,

        /// Starting frame for image-to-video models
        #[arg(long)]
        image_url: Option<String>,

        /// Clip length in seconds
        #[arg(long)]
        duration: Option<u32>,

        #[command(flatten)]
        route: RouteArgs,
    },

    /// Convert text to speech
    Speech {
        text: String,

        #[arg(short, long)]
        voice: Option<String>,

        #[command(flatten)]
        route: RouteArgs,
    },

    /// Generate a persona image now and its video in the background
    Persona {
        prompt: String,

        /// Motion prompt for the video
        #[arg(long)]
        video_prompt: Option<String>,

        /// Wait for the background video before exiting
        #[arg(short, long)]
        wait: bool,
    },

    /// Write a configuration file with the default settings
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Manage override API keys in the OS keyring
    ApiKey {
        /// Provider name (openai, anthropic, etc.)
        provider: String,

        /// Set API key for provider
        #[arg(short, long)]
        set: Option<String>,

        /// Remove API key for provider
        #[arg(short, long)]
        remove: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_command() {
        let cli = Cli::try_parse_from([
            "caprouter", "text", "hello there", "--system", "be brief", "--provider", "anthropic", "-d",
        ])
        .unwrap();

        assert!(cli.debug);
        match cli.command {
            Commands::Text {
                prompt, system, route, ..
            } => {
                assert_eq!(prompt, "hello there");
                assert_eq!(system.as_deref(), Some("be brief"));
                assert_eq!(route.provider.as_deref(), Some("anthropic"));
            }
            _ => panic!("expected text command"),
        }
    }

    #[test]
    fn test_parse_persona_and_api_key() {
        let cli = Cli::try_parse_from(["caprouter", "persona", "a knight", "--wait"]).unwrap();
        assert!(matches!(cli.command, Commands::Persona { wait: true, .. }));

        let cli = Cli::try_parse_from(["caprouter", "api-key", "openai", "--remove"]).unwrap();
        assert!(matches!(cli.command, Commands::ApiKey { remove: true, .. }));

        assert!(Cli::try_parse_from(["caprouter"]).is_err());
    }
}

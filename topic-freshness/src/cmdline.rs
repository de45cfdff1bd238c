use clap::Command;

pub(super) const EXPORTER: &str = "exporter";
pub(super) const ONCE: &str = "once";

pub(super) fn root_cli() -> Command {
    Command::new("topic-freshness")
        .about("Exports the time of the newest event on Kafka topics as Prometheus gauges")
        .long_about(
            "Exports the time of the newest event on Kafka topics as Prometheus gauges.\n\
             All settings are read from the environment (KAFKA_BOOTSTRAP_SERVERS, TOPIC_PREFIX, ...).",
        )
        .subcommand(add_exporter_subcommand())
        .subcommand(add_once_subcommand())
}

fn add_exporter_subcommand() -> Command {
    Command::new(EXPORTER)
        .about("Serve /metrics and refresh the gauges every interval until SIGINT/SIGTERM (default)")
}

fn add_once_subcommand() -> Command {
    Command::new(ONCE).about(
        "Run a single cycle and print the metrics exposition, exits non-zero if the cycle failed",
    )
}

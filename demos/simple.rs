use std::time::Duration;

use mio_dns_stub::{Channel, Options, QType};
use tracing_subscriber::EnvFilter;

const TIMEOUT: u64 = 5;
const TESTS: &[(&str, u16)] = &[("www.rust-lang.org", QType::A),
                                ("localhost.loggerhead.me", QType::A),
                                ("www.google.com", QType::AAAA),
                                ("rust-lang.org", QType::MX),
                                ("nonexistent.invalid", QType::A)];

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "mio_dns_stub=debug".into()))
        .init();

    let options = Options::new()
        .server("8.8.8.8")
        .and_then(|options| options.server("1.1.1.1"))
        .unwrap()
        .edns(1232)
        .timeout(Duration::new(TIMEOUT, 0));
    let mut channel = Channel::new(options).unwrap();

    for &(hostname, qtype) in TESTS {
        let res = channel.query(hostname, qtype, move |answer, timeouts| {
            match answer {
                Ok(msg) => println!("{} ({}) => {} bytes, {} timeouts", hostname, qtype, msg.len(), timeouts),
                Err(e) => println!("{} ({}) => ERROR: {}", hostname, qtype, e),
            }
        });
        if let Err(e) = res {
            println!("ERROR: {}", e);
        }
    }

    if let Err(e) = channel.run() {
        println!("ERROR: {}", e);
    }
}

use fleetmeter::{bucketize, Aggregator, BucketSpec, KeyedValues, Value};
use getopts::Options;
use log::{error, info};
use std::env;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_millis() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock set before the Unix epoch");
    (since_epoch.as_secs() * 1_000) + u64::from(since_epoch.subsec_millis())
}

struct HostSimulator {
    id: String,
    host: String,
    seed: u64,
}

impl HostSimulator {
    fn new(id: String, host: String, seed: u64) -> HostSimulator {
        HostSimulator { id, host, seed }
    }

    fn run(&mut self, publisher: fleetmeter::Publisher) {
        let spec = BucketSpec::default_latency();
        loop {
            // A deterministic, host-flavored spread of fake latencies.
            let mut dist = Vec::new();
            for i in 0..20 {
                self.seed = self.seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
                let sample = ((self.seed >> 33) % 500) as f64 + (i as f64);
                bucketize(&mut dist, sample, 1.0, &spec);
            }

            let mut keys = KeyedValues::default();
            keys.insert("GET".to_string(), Value::Distribution(dist));

            if publisher
                .publish(&self.id, &self.host, now_millis(), Value::Decomposition(keys))
                .is_err()
            {
                return;
            }

            thread::sleep(Duration::from_secs(1));
        }
    }
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

pub fn opts() -> Options {
    let mut opts = Options::new();

    opts.optopt("s", "sources", "number of simulated source hosts", "INTEGER");
    opts.optopt("c", "capacity", "maximum number of unprocessed data messages", "INTEGER");
    opts.optflag("h", "help", "print this help menu");

    opts
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let program = &args[0];
    let opts = opts();

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            error!("Failed to parse command line args: {}", f);
            return;
        },
    };

    if matches.opt_present("help") {
        print_usage(program, &opts);
        return;
    }

    info!("fleetmeter simulation");

    let sources: usize = matches
        .opt_str("sources")
        .unwrap_or_else(|| "4".to_owned())
        .parse()
        .unwrap();
    let capacity: usize = matches
        .opt_str("capacity")
        .unwrap_or_else(|| "256".to_owned())
        .parse()
        .unwrap();

    info!("sources: {}", sources);
    info!("capacity: {}", capacity);

    let mut aggregator = Aggregator::builder().capacity(capacity).build();
    let publisher = aggregator.get_publisher();
    let controller = aggregator.get_controller();

    thread::spawn(move || aggregator.run());

    controller
        .enable("fleet.latency", 1, "data.fleet.latency")
        .expect("failed to enable instrumentation");

    // Spin up our simulated hosts.
    for i in 0..sources {
        let publisher = publisher.clone();
        let mut host = HostSimulator::new(
            "fleet.latency".to_string(),
            format!("host-{}", i),
            0x5DEE_CE66 + i as u64,
        );
        thread::spawn(move || host.run(publisher));
    }

    // Poll the controller and report what the fleet looks like.
    for turn in 0..60 {
        thread::sleep(Duration::from_secs(2));

        match controller.query("fleet.latency") {
            Ok(response) => {
                info!(
                    "bucket {}: {}/{} sources reporting",
                    response.when, response.reporting_count, response.source_count
                );
            },
            Err(e) => error!("query failed: {}", e),
        }

        if turn % 10 == 9 {
            match controller.window("fleet.latency", 20, &[]) {
                Ok(view) => {
                    info!(
                        "window [{}, {}]: keys {:?}, min reporting {}, min {} max {} total {}",
                        view.start,
                        view.end,
                        view.present_keys,
                        view.min_reporting,
                        view.summary.min,
                        view.summary.max,
                        view.summary.total
                    );
                },
                Err(e) => error!("window query failed: {}", e),
            }
        }
    }

    if let Ok(status) = controller.status() {
        for entry in status {
            info!(
                "instrumentation {}: {} sources, last bucket {}",
                entry.id, entry.source_count, entry.last_time
            );
        }
    }
}

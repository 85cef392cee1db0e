//! Clients ping a shared server and wait for the pong.
//!
//! Every schedule must move each client to `Done`, and the `Outstanding` monitor, which is hot
//! while any ping is unanswered, must cool down before the program quiesces.

use machinist::report::WriteReporter;
use machinist::*;

#[derive(Debug, Hash)]
struct Ping(ActorId);
impl Event for Ping {}

#[derive(Debug, Hash)]
struct Pong;
impl Event for Pong {}

#[derive(Debug, Hash)]
struct Sent;
impl Event for Sent {}

#[derive(Debug, Hash)]
struct Answered;
impl Event for Answered {}

struct Client {
    server: ActorId,
}

impl Machine for Client {
    fn declare(d: &mut Declaration<Self>) {
        d.state("Init")
            .entry(|ctx| {
                let (server, me) = (ctx.server, ctx.id());
                ctx.monitor::<Outstanding, _>(Sent)?;
                ctx.send(server, Ping(me))
            })
            .goto_on::<Pong>("Done");
        d.state("Done")
            .entry(|ctx| ctx.monitor::<Outstanding, _>(Answered));
    }
}

struct Server;

impl Machine for Server {
    fn declare(d: &mut Declaration<Self>) {
        d.state("Serving")
            .on_event(|ctx, ping: &Ping| ctx.send(ping.0, Pong));
    }
}

#[derive(Default)]
struct Outstanding {
    pending: usize,
}

impl Monitor for Outstanding {
    fn declare(d: &mut Declaration<Self>) {
        d.state("Quiet")
            .cold()
            .invoke_on::<Sent>(|ctx| {
                ctx.pending += 1;
                ctx.goto("Pending")
            });
        d.state("Pending")
            .hot()
            .invoke_on::<Sent>(|ctx| {
                ctx.pending += 1;
                Ok(())
            })
            .invoke_on::<Answered>(|ctx| {
                ctx.pending -= 1;
                if ctx.pending == 0 {
                    ctx.goto("Quiet")?;
                }
                Ok(())
            });
    }

    fn hashed_state(&self) -> u64 {
        stable_hash(&self.pending)
    }
}

fn program(clients: usize) -> impl Fn(&mut Setup) + Sync {
    move |setup: &mut Setup| {
        setup.register_monitor(Outstanding::default());
        let server = setup.create(Server);
        for _ in 0..clients {
            setup.create(Client { server });
        }
    }
}

fn main() -> Result<(), pico_args::Error> {
    env_logger::init_from_env(env_logger::Env::default()
        .default_filter_or("info")); // `RUST_LOG=${LEVEL}` env variable to override

    let mut args = pico_args::Arguments::from_env();
    let config = match args.subcommand()?.as_deref() {
        Some("dfs") => {
            let clients: usize = args.opt_free_from_str()?.unwrap_or(2);
            println!("Exhaustively testing ping-pong with {} clients.", clients);
            Some((clients, Config::default().strategy(StrategyKind::Dfs).iterations(1_000_000)))
        }
        Some("random") => {
            let clients: usize = args.opt_free_from_str()?.unwrap_or(3);
            let iterations: usize = args.opt_free_from_str()?.unwrap_or(10_000);
            println!("Randomly testing ping-pong with {} clients.", clients);
            let config = Config::default()
                .strategy(StrategyKind::Random { seed: 0 })
                .iterations(iterations)
                .threads(num_cpus::get());
            Some((clients, config))
        }
        Some("pct") => {
            let clients: usize = args.opt_free_from_str()?.unwrap_or(3);
            let iterations: usize = args.opt_free_from_str()?.unwrap_or(10_000);
            println!("Testing ping-pong with {} clients under PCT.", clients);
            let config = Config::default()
                .strategy(StrategyKind::Pct { seed: 0, switch_points: 2 })
                .iterations(iterations)
                .threads(num_cpus::get());
            Some((clients, config))
        }
        _ => None,
    };

    match config {
        Some((clients, config)) => {
            let config = config.check_liveness(true);
            TestingEngine::new(program(clients), config)
                .run_and_report(&mut WriteReporter::new(&mut std::io::stdout()));
        }
        None => {
            println!("USAGE:");
            println!("  ./ping-pong dfs [CLIENT_COUNT]");
            println!("  ./ping-pong random [CLIENT_COUNT] [ITERATIONS]");
            println!("  ./ping-pong pct [CLIENT_COUNT] [ITERATIONS]");
        }
    }

    Ok(())
}

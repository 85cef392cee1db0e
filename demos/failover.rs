//! A coordinator forwards client requests to a primary replica and fails over to a backup once a
//! watchdog sees the primary crash.
//!
//! The crash happens at a point of the scheduler's choosing, so a request may be lost in the
//! primary's mailbox or be answered twice. The `--buggy` coordinator does not resend the
//! request it was waiting for when it fails over, which leaves the client blocked forever.
//!
//! A bug found by `check` can be saved with `--save FILE` and reproduced with `replay FILE`.

use machinist::report::WriteReporter;
use machinist::*;

#[derive(Clone, Copy, Debug, Hash)]
struct Request {
    id: usize,
    client: ActorId,
}
impl Event for Request {}

#[derive(Debug, Hash)]
struct Response {
    id: usize,
}
impl Event for Response {}

#[derive(Debug, Hash)]
struct Failed;
impl Event for Failed {}

#[derive(Debug, Hash)]
struct Issued;
impl Event for Issued {}

#[derive(Debug, Hash)]
struct Completed;
impl Event for Completed {}

/// Answers every request it receives, via the coordinator.
struct Replica {
    coordinator: Option<ActorId>,
}

#[derive(Debug, Hash)]
struct Attach(ActorId);
impl Event for Attach {}

impl Machine for Replica {
    fn declare(d: &mut Declaration<Self>) {
        d.state("Detached")
            .on_event(|ctx, attach: &Attach| {
                ctx.coordinator = Some(attach.0);
                ctx.goto("Serving")
            })
            .defer::<Request>();
        d.state("Serving").on_event(|ctx, request: &Request| {
            match ctx.coordinator {
                Some(coordinator) => ctx.send(coordinator, Response { id: request.id }),
                None => Ok(()),
            }
        });
    }
}

struct Coordinator {
    primary: ActorId,
    backup: ActorId,
    active: ActorId,
    pending: Option<Request>,
    resend_on_failover: bool,
}

impl Coordinator {
    fn forward(ctx: &mut Context<'_, Self>, request: &Request) -> ActionResult {
        ctx.pending = Some(*request);
        let active = ctx.active;
        ctx.send(active, *request)
    }

    fn answer(ctx: &mut Context<'_, Self>, response: &Response) -> ActionResult {
        match ctx.pending {
            Some(request) if request.id == response.id => {
                ctx.pending = None;
                ctx.send(request.client, Response { id: response.id })
            }
            _ => {
                log::debug!("Dropping a duplicate response to request {}.", response.id);
                Ok(())
            }
        }
    }
}

impl Machine for Coordinator {
    fn declare(d: &mut Declaration<Self>) {
        d.state("Replicated")
            .entry(|ctx| {
                let (me, primary, backup) = (ctx.id(), ctx.primary, ctx.backup);
                ctx.send(primary, Attach(me))?;
                ctx.send(backup, Attach(me))
            })
            .on_event(Self::forward)
            .on_event(Self::answer)
            .goto_on::<Failed>("Degraded");
        d.state("Degraded")
            .entry(|ctx| {
                ctx.active = ctx.backup;
                match ctx.pending {
                    Some(request) if ctx.resend_on_failover => {
                        let backup = ctx.backup;
                        ctx.send(backup, request)
                    }
                    _ => Ok(()),
                }
            })
            .on_event(Self::forward)
            .on_event(Self::answer);
    }

    fn hashed_state(&self) -> u64 {
        stable_hash(&(self.active, self.pending))
    }
}

/// Tells the coordinator once the watched replica has halted.
struct Watchdog {
    watched: ActorId,
    coordinator: ActorId,
}

impl Machine for Watchdog {
    fn declare(d: &mut Declaration<Self>) {
        d.state("Watching").entry(|ctx| {
            let (watched, coordinator) = (ctx.watched, ctx.coordinator);
            ctx.join_any(&[watched])?;
            ctx.send(coordinator, Failed)
        });
    }
}

/// Crashes the primary.
struct Chaos {
    victim: ActorId,
}

impl Machine for Chaos {
    fn declare(d: &mut Declaration<Self>) {
        d.state("Waiting").entry(|ctx| {
            let victim = ctx.victim;
            ctx.send(victim, Halt)
        });
    }
}

/// Issues one to three requests, one at a time.
struct Client {
    coordinator: ActorId,
}

impl Machine for Client {
    fn declare(d: &mut Declaration<Self>) {
        d.state("Requesting")
            .entry(|ctx| {
                let (coordinator, me) = (ctx.coordinator, ctx.id());
                let count = ctx.random_integer(3)? + 1;
                for id in 0..count {
                    ctx.monitor::<Availability, _>(Issued)?;
                    ctx.send(coordinator, Request { id, client: me })?;
                    let response = ctx.receive::<Response>()?;
                    ctx.assert(response.id == id, format!("expected {}, got {}", id, response.id))?;
                    ctx.monitor::<Availability, _>(Completed)?;
                }
                ctx.goto("Done")
            });
        d.state("Done");
    }
}

/// Hot while a request is unanswered.
struct Availability;

impl Monitor for Availability {
    fn declare(d: &mut Declaration<Self>) {
        d.state("Answered").cold().goto_on::<Issued>("Waiting");
        d.state("Waiting").hot().goto_on::<Completed>("Answered");
    }
}

fn program(resend_on_failover: bool) -> impl Fn(&mut Setup) + Sync {
    move |setup: &mut Setup| {
        setup.register_monitor(Availability);
        let primary = setup.create(Replica { coordinator: None });
        let backup = setup.create(Replica { coordinator: None });
        let coordinator = setup.create(Coordinator {
            primary,
            backup,
            active: primary,
            pending: None,
            resend_on_failover,
        });
        setup.create(Watchdog {
            watched: primary,
            coordinator,
        });
        setup.create(Chaos { victim: primary });
        setup.create(Client { coordinator });
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init_from_env(env_logger::Env::default()
        .default_filter_or("info")); // `RUST_LOG=${LEVEL}` env variable to override

    let mut args = pico_args::Arguments::from_env();
    let buggy = args.contains("--buggy");
    match args.subcommand()?.as_deref() {
        Some("check") => {
            let iterations: usize = args.opt_value_from_str("--iterations")?.unwrap_or(10_000);
            let save: Option<String> = args.opt_value_from_str("--save")?;
            println!(
                "Testing the {} coordinator over {} iterations.",
                if buggy { "buggy" } else { "fixed" },
                iterations
            );
            let config = Config::default()
                .strategy(StrategyKind::FairPct { seed: 0, switch_points: 3, prefix: 100 })
                .iterations(iterations)
                .threads(num_cpus::get())
                .check_liveness(true)
                .fail_fast(true);
            let report = TestingEngine::new(program(!buggy), config)
                .run_and_report(&mut WriteReporter::new(&mut std::io::stdout()));
            if let (Some(path), Some(trace)) = (save, report.trace_to_replay()) {
                let bug = &report.bugs[0];
                let kind = bug.kind.to_string();
                trace.save(&path, &[kind.as_str(), bug.message.as_str()])?;
                println!("Saved the schedule of the first bug to {}.", path);
            }
        }
        Some("replay") => {
            let path: String = args.free_from_str()?;
            let trace = ScheduleTrace::load(&path)?;
            println!("Replaying {} decisions from {}.", trace.len(), path);
            let engine = TestingEngine::new(program(!buggy), Config::default());
            let replayed = engine.replay(&trace)?;
            println!("Outcome: {:?}", replayed.outcome);
        }
        _ => {
            println!("USAGE:");
            println!("  ./failover check [--buggy] [--iterations N] [--save FILE]");
            println!("  ./failover replay [--buggy] FILE");
        }
    }

    Ok(())
}

use clap::{Parser, Subcommand, ValueEnum};
use client::network::CoordinatorClient;
use client::rcon;
use log::info;
use shared::{Assignment, BalanceMode, Packet, ServerTarget, SkillRating, UserId, VetoMode};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Coordinator address
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// User id asserted to the coordinator
    #[arg(short = 'u', long, default_value = "1")]
    user: UserId,

    /// Seconds to wait for a coordinator reply
    #[arg(long, default_value = "3")]
    reply_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run console commands directly on a game server
    Rcon {
        /// Game server control address (host:port)
        #[arg(short = 'a', long)]
        address: String,
        #[arg(short = 'p', long)]
        password: String,
        #[arg(short = 't', long, default_value = "5")]
        timeout_secs: u64,
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Create a lobby
    Create {
        /// Comma separated map pool
        #[arg(short = 'm', long, value_delimiter = ',', required = true)]
        maps: Vec<String>,
        #[arg(long, value_enum, default_value = "captains")]
        mode: ModeArg,
        /// Game server control address (host:port)
        #[arg(long)]
        game_server: Option<String>,
        #[arg(long, requires = "game_server")]
        rcon_password: Option<String>,
        #[arg(long)]
        connect_password: Option<String>,
    },
    /// Join a lobby's waiting room
    Join {
        #[arg(short = 'l', long)]
        lobby: u64,
        #[arg(short = 'n', long)]
        name: String,
        #[arg(long)]
        tier: Option<u8>,
        #[arg(long)]
        rating: Option<f64>,
    },
    /// Leave a lobby
    Leave {
        #[arg(short = 'l', long)]
        lobby: u64,
    },
    /// Move a player between teams and the waiting room
    Move {
        #[arg(short = 'l', long)]
        lobby: u64,
        #[arg(long)]
        player: UserId,
        #[arg(long, value_enum)]
        to: SeatArg,
    },
    /// Split the lobby into two teams
    Balance {
        #[arg(short = 'l', long)]
        lobby: u64,
        #[arg(long, value_enum, default_value = "scramble")]
        mode: BalanceArg,
    },
    /// Start the map veto
    Start {
        #[arg(short = 'l', long)]
        lobby: u64,
    },
    /// Ban a map (captain mode)
    Ban {
        #[arg(short = 'l', long)]
        lobby: u64,
        #[arg(short = 'm', long)]
        map: String,
    },
    /// Vote for maps to ban (player vote mode)
    Vote {
        #[arg(short = 'l', long)]
        lobby: u64,
        #[arg(short = 'm', long, value_delimiter = ',', required = true)]
        maps: Vec<String>,
    },
    /// Print lobby updates as they arrive
    Watch {
        #[arg(short = 'l', long)]
        lobby: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Captains,
    Players,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BalanceArg {
    Scramble,
    Random,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SeatArg {
    Team1,
    Team2,
    Waiting,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let request = match args.command {
        Command::Rcon {
            address,
            password,
            timeout_secs,
            commands,
        } => return run_rcon(&address, &password, &commands, timeout_secs).await,
        Command::Create {
            maps,
            mode,
            game_server,
            rcon_password,
            connect_password,
        } => Packet::CreateLobby {
            map_pool: maps,
            veto_mode: match mode {
                ModeArg::Captains => VetoMode::Captains,
                ModeArg::Players => VetoMode::Players,
            },
            server: game_server
                .map(|addr| ServerTarget::new(addr, rcon_password.unwrap_or_default())),
            connect_password,
        },
        Command::Join {
            lobby,
            name,
            tier,
            rating,
        } => Packet::JoinLobby {
            lobby,
            name,
            skill: SkillRating { tier, rating },
        },
        Command::Leave { lobby } => Packet::LeaveLobby { lobby },
        Command::Move { lobby, player, to } => Packet::MovePlayer {
            lobby,
            user_id: player,
            assignment: match to {
                SeatArg::Team1 => Assignment::Team1,
                SeatArg::Team2 => Assignment::Team2,
                SeatArg::Waiting => Assignment::WaitingRoom,
            },
        },
        Command::Balance { lobby, mode } => Packet::Balance {
            lobby,
            mode: match mode {
                BalanceArg::Scramble => BalanceMode::Scramble,
                BalanceArg::Random => BalanceMode::Random,
            },
        },
        Command::Start { lobby } => Packet::StartMatch { lobby },
        Command::Ban { lobby, map } => Packet::Ban { lobby, map },
        Command::Vote { lobby, maps } => Packet::Vote { lobby, maps },
        Command::Watch { lobby } => Packet::Subscribe { lobby },
    };
    let watching = matches!(request, Packet::Subscribe { .. });

    let mut client = CoordinatorClient::new(
        &args.server,
        args.user,
        Duration::from_secs(args.reply_timeout),
    )
    .await?;
    client.connect().await?;

    let reply = client.request(&request).await?;
    print_reply(&reply);
    if watching {
        info!("Watching for lobby updates, Ctrl+C to stop");
        client.watch(print_reply).await?;
    }
    client.disconnect().await?;

    match reply {
        Packet::Rejected { reason } => Err(reason.into()),
        _ => Ok(()),
    }
}

async fn run_rcon(
    address: &str,
    password: &str,
    commands: &[String],
    timeout_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let target = ServerTarget::new(address, password);
    let (host, port) = target
        .host_port()
        .ok_or_else(|| format!("invalid control address '{}'", address))?;

    let responses =
        rcon::execute(host, port, password, commands, Duration::from_secs(timeout_secs)).await?;
    for (command, response) in commands.iter().zip(responses) {
        println!("> {}", command);
        if !response.is_empty() {
            println!("{}", response.trim_end());
        }
    }
    Ok(())
}

fn print_reply(packet: &Packet) {
    match packet {
        Packet::LobbyCreated { lobby } => println!("Created lobby {}", lobby),
        Packet::LobbyUpdated {
            lobby,
            updated_at,
            veto,
            players,
        } => {
            println!("Lobby {} (updated {})", lobby, updated_at);
            println!("  phase: {:?}", veto.phase);
            println!("  pool: {}", veto.pool.join(", "));
            for ban in &veto.banned {
                println!("  banned {} by {:?}", ban.map, ban.by);
            }
            if let Some(turn) = veto.turn {
                println!("  turn: {:?} (deadline {:?})", turn, veto.deadline);
            }
            if let Some(map) = &veto.final_map {
                println!("  final map: {}", map);
            }
            for player in players {
                println!(
                    "  {:>12} {:?}{}",
                    player.name,
                    player.assignment,
                    if player.captain { " (captain)" } else { "" }
                );
            }
        }
        Packet::Rejected { reason } => eprintln!("Rejected: {}", reason),
        other => println!("{:?}", other),
    }
}

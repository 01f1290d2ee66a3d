use blindvote::{Election, Event, VotePayload};

/// Check a vote payload's token against an election's coordinator key, offline
pub fn command_verify(matches: &clap::ArgMatches) {
    let payload = matches.value_of("PAYLOAD").unwrap_or_default();
    let payload = match VotePayload::parse(payload.trim()) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("blindvote verify: {}", e);
            std::process::exit(1);
        }
    };

    let filename = crate::expand(matches.value_of("election").unwrap_or_default());
    let election = read_election(&filename);

    if election.candidate(payload.candidate_id).is_none() {
        eprintln!(
            "blindvote verify: candidate {} is not in election {}",
            payload.candidate_id, election.id
        );
        std::process::exit(1);
    }

    if !payload.verify(&election.rsa_pub_key) {
        eprintln!("blindvote verify: token does not verify for election {}", election.id);
        std::process::exit(1);
    }

    println!("> Token verified OK for election {}", election.id);
}

/// Accepts either a signed election event or the bare election JSON
fn read_election(filename: &str) -> Election {
    let contents = match std::fs::read_to_string(filename) {
        Ok(contents) => contents,
        Err(e) => {
            eprintln!("blindvote verify: unable to read {}: {}", filename, e);
            std::process::exit(1);
        }
    };

    if let Ok(event) = serde_json::from_str::<Event>(&contents) {
        return Election::from_event(&event).unwrap_or_else(|e| {
            eprintln!("blindvote verify: invalid election event in {}: {}", filename, e);
            std::process::exit(1);
        });
    }

    serde_json::from_str(&contents).unwrap_or_else(|e| {
        eprintln!("blindvote verify: unable to read {}: {}", filename, e);
        std::process::exit(1);
    })
}

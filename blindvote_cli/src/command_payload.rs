use blindvote::VotePayload;

/// Compose a vote payload from its base64 parts
pub fn command_payload(matches: &clap::ArgMatches) {
    let hash = decode_arg(matches, "hash");
    let token = decode_arg(matches, "token");
    let randomizer = decode_arg(matches, "randomizer");

    let candidate = matches.value_of("candidate").unwrap_or_default();
    let candidate_id: u32 = match candidate.parse() {
        Ok(id) => id,
        Err(_) => {
            eprintln!("blindvote payload: invalid candidate id {}", candidate);
            std::process::exit(1);
        }
    };

    let payload = VotePayload::new(&hash, &token, &randomizer, candidate_id).to_string();

    // Whatever we print must be accepted on the wire
    if let Err(e) = VotePayload::parse(&payload) {
        eprintln!("blindvote payload: {}", e);
        std::process::exit(1);
    }

    println!("{}", payload);
}

fn decode_arg(matches: &clap::ArgMatches, name: &str) -> Vec<u8> {
    let value = matches.value_of(name).unwrap_or_default();
    match base64::decode(value.trim()) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => {
            eprintln!("blindvote payload: --{} must be non-empty base64", name);
            std::process::exit(1);
        }
    }
}

use blindvote::{Message, MessageKind, ProtocolError, VotePayload};

pub fn command_decode(matches: &clap::ArgMatches) {
    let input = matches.value_of("JSON").unwrap_or_default();
    let input = match input {
        "-" => read_stdin(),
        json => json.to_owned(),
    };

    let message = match Message::decode(&input) {
        Ok(message) => message,
        Err(e) => {
            eprintln!("blindvote decode: {}", e);
            std::process::exit(1);
        }
    };

    println!("election: {}", message.id);
    println!("kind:     {} ({})", message.kind, message.kind as u8);

    match message.kind {
        MessageKind::Token => {
            let len = message.payload_bytes().map(|b| b.len()).unwrap_or_default();
            println!("payload:  {} bytes", len);
        }
        MessageKind::Vote => match VotePayload::parse(&message.payload) {
            Ok(vote) => {
                println!("hash:      {}", hex::encode(&vote.hash));
                println!("token:     {} bytes", vote.token.len());
                println!("candidate: {}", vote.candidate_id);
            }
            Err(e) => {
                eprintln!("blindvote decode: {}", e);
                std::process::exit(1);
            }
        },
        MessageKind::Error => {
            let error = ProtocolError::from_payload(&message.error_text());
            println!("error:    {} ({})", error.code(), error);
            println!("clears session: {}", error.clears_session());
        }
    }
}

fn read_stdin() -> String {
    use std::io::Read;

    let mut buf = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut buf) {
        eprintln!("blindvote decode: unable to read stdin: {}", e);
        std::process::exit(1);
    }
    buf
}

use blindvote::Config;

pub fn command_keygen(matches: &clap::ArgMatches, config: &Config) {
    // Show the configured voter identity instead of a fresh one
    if matches.is_present("from-env") {
        println!("public-key: {}", hex::encode(config.public_key().as_bytes()));
        return;
    }

    let (secret, public) = blindvote::generate_keypair();
    println!("secret-key: {}", hex::encode(secret.as_bytes()));
    println!("public-key: {}", hex::encode(public.as_bytes()));
    println!();
    println!("export BLINDVOTE_SECRET_KEY={}", hex::encode(secret.as_bytes()));
}

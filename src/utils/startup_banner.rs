pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                              _
   __ _  _ __    ___    __| |  ___
  / _` || '_ \  / _ \  / _` | / _ \
 | (_| || | | || (_) || (_| ||  __/
  \__, ||_| |_| \___/  \__,_| \___|
     |_|                            "#;
    const APP_DESCRIPTION: &str =
        "Queue broker worker node: TCP/UDP clients, leader failover and request forwarding.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("QNODE_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}

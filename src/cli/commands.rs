use clap::ArgMatches;
use log::info;

use crate::config::Config;
use crate::modbus::connection::Connection;
use crate::modbus::executor::RequestExecutor;
use crate::modbus::protocol::{ExchangeValue, Operation, RegisterTable, MAX_READ_QUANTITY};
use crate::output::formatter_for;
use crate::services::DataService;
use crate::utils::error::ModbusError;

const DEFAULT_CONFIG_PATH: &str = "rtu_link.toml";

fn parse<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, ModbusError> {
    match matches.get_one::<String>(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ModbusError::ConfigError(format!("invalid {}: '{}'", name, raw))),
        None => Ok(None),
    }
}

fn required<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<T, ModbusError> {
    parse(matches, name)?.ok_or_else(|| ModbusError::ConfigError(format!("missing {}", name)))
}

async fn one_shot(config: &Config, op: Operation) -> Result<ExchangeValue, ModbusError> {
    let mut executor = RequestExecutor::new(
        Connection::new(config.connection_params()),
        config.retry_policy(),
        config.operation_timeouts(),
    );
    executor.connect().await?;
    let result = executor.run(&op, None).await;
    executor.disconnect().await;
    result
}

/// Runs the selected subcommand. Returns false when none was given.
pub async fn handle_subcommands(matches: &ArgMatches, config: &Config) -> Result<bool, ModbusError> {
    let formatter = formatter_for(&config.output.format);

    if let Some(matches) = matches.subcommand_matches("read") {
        let address: u16 = required(matches, "address")?;
        let count: u16 = parse(matches, "count")?.unwrap_or(1);
        if count == 0 || count > MAX_READ_QUANTITY {
            return Err(ModbusError::ConfigError(format!(
                "count must be between 1 and {}",
                MAX_READ_QUANTITY
            )));
        }
        let table = if matches.get_flag("holding") {
            RegisterTable::Holding
        } else {
            RegisterTable::Input
        };

        info!("🔍 Reading {} register(s) at {} from {:?} table", count, address, table);
        let op = if count == 1 {
            Operation::ReadOne { table, address }
        } else {
            Operation::ReadMany {
                table,
                address,
                count,
                max_chunk: config.timing.max_chunk,
            }
        };
        let value = one_shot(config, op).await?;
        print!("{}", formatter.format_registers(address, &value.registers()));
        return Ok(true);
    }

    if let Some(matches) = matches.subcommand_matches("write") {
        let address: u16 = required(matches, "address")?;
        let value: u16 = required(matches, "value")?;

        info!("✏️  Writing {} to register {}", value, address);
        one_shot(config, Operation::write_one(address, value)).await?;
        println!("✅ Register {} = {} confirmed by device", address, value);
        return Ok(true);
    }

    if let Some(matches) = matches.subcommand_matches("config") {
        let path = matches
            .get_one::<String>("output")
            .map(String::as_str)
            .unwrap_or(DEFAULT_CONFIG_PATH);
        config.save_to_file(path)?;
        println!("📄 Configuration written to {}", path);
        return Ok(true);
    }

    if matches.subcommand_matches("run").is_some() {
        let mut service = DataService::new(config.clone())?;
        service.run().await?;
        return Ok(true);
    }

    Ok(false)
}

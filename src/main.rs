#[rocket::launch]
fn rocket() -> _ {
    import_server::init_logger();
    log::info!("Starting import API server");

    import_server::rocket()
}

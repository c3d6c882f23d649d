fn main() {
    makepad_map_picker_demo::app_main()
}
